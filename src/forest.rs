//! Comment forests.
//!
//! A thread's comments are kept in an arena: every comment is a node addressed by
//! index, with its parent index and an ordered list of child indices. Building and
//! walking the arena never recurses, so a thousand-deep reply chain costs heap, not
//! stack.
//!
//! [`ThreadBuilder`] turns Reddit's raw listing JSON into a forest. Reddit collapses
//! large threads behind `more` stubs; the builder records those as placeholder
//! slots, hands them out through [`ThreadBuilder::next_pending`], and splices the
//! expanded comments back in at the placeholder's position so reply order survives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io;

use crate::error::{RedditError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub parent_id: String,
    pub link_id: String,
    pub author: Option<String>,
    pub body: String,
    pub created_utc: i64,
    pub score: i64,
    pub depth: u32,
}

#[derive(Debug, Clone)]
struct Node {
    comment: Comment,
    children: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CommentForest {
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

impl CommentForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `comment` as the last child of `parent` (or as the last top-level
    /// comment). Depth is derived from the position: top-level comments are depth 0.
    pub fn push(&mut self, parent: Option<usize>, mut comment: Comment) -> usize {
        let idx = self.nodes.len();
        comment.depth = match parent {
            Some(p) => self.nodes[p].comment.depth + 1,
            None => 0,
        };
        self.nodes.push(Node {
            comment,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p].children.push(idx),
            None => self.roots.push(idx),
        }
        idx
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn comment(&self, idx: usize) -> &Comment {
        &self.nodes[idx].comment
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.nodes[idx].children
    }

    pub fn max_depth(&self) -> Option<u32> {
        self.nodes.iter().map(|n| n.comment.depth).max()
    }

    /// Depth-first, parents before children, siblings in upstream order.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            forest: self,
            stack: self.roots.iter().rev().copied().collect(),
        }
    }
}

pub struct Preorder<'a> {
    forest: &'a CommentForest,
    stack: Vec<usize>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = (usize, &'a Comment);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        self.stack
            .extend(self.forest.nodes[idx].children.iter().rev().copied());
        Some((idx, &self.forest.nodes[idx].comment))
    }
}

// ---------- record format ----------------------------------------------------

enum Step {
    Enter { idx: usize, first: bool },
    Leave,
}

impl CommentForest {
    /// Write the forest as nested JSON (`[{..., "replies": [...]}, ...]`).
    ///
    /// An explicit stack of open objects stands in for recursion, so depth is
    /// bounded only by memory.
    pub fn write_json<W: io::Write>(&self, out: &mut W) -> serde_json::Result<()> {
        let mut stack: Vec<Step> = Vec::new();
        push_siblings(&mut stack, &self.roots);
        out.write_all(b"[").map_err(serde_json::Error::io)?;
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter { idx, first } => {
                    if !first {
                        out.write_all(b",").map_err(serde_json::Error::io)?;
                    }
                    let c = &self.nodes[idx].comment;
                    out.write_all(b"{\"id\":").map_err(serde_json::Error::io)?;
                    serde_json::to_writer(&mut *out, &c.id)?;
                    write_field(out, "parent_id", &c.parent_id)?;
                    write_field(out, "link_id", &c.link_id)?;
                    write_field(out, "author", &c.author)?;
                    write_field(out, "body", &c.body)?;
                    write_field(out, "created_utc", &c.created_utc)?;
                    write_field(out, "score", &c.score)?;
                    write_field(out, "depth", &c.depth)?;
                    out.write_all(b",\"replies\":[").map_err(serde_json::Error::io)?;
                    stack.push(Step::Leave);
                    push_siblings(&mut stack, &self.nodes[idx].children);
                }
                Step::Leave => out.write_all(b"]}").map_err(serde_json::Error::io)?,
            }
        }
        out.write_all(b"]").map_err(serde_json::Error::io)
    }
}

fn push_siblings(stack: &mut Vec<Step>, ids: &[usize]) {
    stack.extend(
        ids.iter()
            .enumerate()
            .rev()
            .map(|(i, &idx)| Step::Enter { idx, first: i == 0 }),
    );
}

/// Write `,"name":value`.
pub(crate) fn write_field<W: io::Write, T: Serialize + ?Sized>(
    out: &mut W,
    name: &str,
    value: &T,
) -> serde_json::Result<()> {
    write!(out, ",\"{name}\":").map_err(serde_json::Error::io)?;
    serde_json::to_writer(&mut *out, value)
}

// ---------- building from Reddit listings -----------------------------------

/// Work the builder still needs fetched before the forest is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// A "load more comments" stub: fetch these ids through `morechildren`.
    Children { stub: usize, ids: Vec<String> },
    /// A "continue this thread" stub: fetch the subtree below this comment.
    Continue { stub: usize, comment_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Comment(usize),
    More(usize),
}

#[derive(Debug)]
struct DraftNode {
    comment: Comment,
    slots: Vec<Slot>,
}

#[derive(Debug)]
struct MoreStub {
    id: String,
    parent: Option<usize>,
    parent_fullname: String,
    children: Vec<String>,
    resolved: bool,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    link_id: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    score: i64,
}

#[derive(Debug, Deserialize)]
struct RawMore {
    #[serde(default)]
    id: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    children: Vec<String>,
}

pub struct ThreadBuilder {
    link_id: String,
    nodes: Vec<DraftNode>,
    root: Vec<Slot>,
    stubs: Vec<MoreStub>,
    by_fullname: HashMap<String, usize>,
    continued: HashSet<String>,
}

impl ThreadBuilder {
    /// `link_id` is the thread fullname (`t3_…`).
    pub fn new(link_id: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            nodes: Vec::new(),
            root: Vec::new(),
            stubs: Vec::new(),
            by_fullname: HashMap::new(),
            continued: HashSet::new(),
        }
    }

    /// Ingest the comment listing returned alongside the post.
    pub fn ingest_listing(&mut self, listing: &Value) -> Result<()> {
        let items = listing_children(listing);
        let slots = self.ingest_children(None, items)?;
        self.root.extend(slots);
        Ok(())
    }

    /// Next placeholder to expand, or `None` once the forest is complete.
    /// Stubs that carry nothing to fetch are dropped on the way.
    pub fn next_pending(&mut self) -> Option<Expansion> {
        loop {
            let stub = self.stubs.iter().position(|s| !s.resolved)?;
            let s = &self.stubs[stub];
            if s.children.is_empty() {
                if let Some(comment_id) = s.parent_fullname.strip_prefix("t1_") {
                    let comment_id = comment_id.to_string();
                    if self.continued.insert(comment_id.clone()) {
                        return Some(Expansion::Continue { stub, comment_id });
                    }
                }
            } else {
                let wanted: Vec<String> = s
                    .children
                    .iter()
                    .filter(|c| !self.by_fullname.contains_key(&format!("t1_{c}")))
                    .cloned()
                    .collect();
                if !wanted.is_empty() {
                    return Some(Expansion::Children { stub, ids: wanted });
                }
            }
            self.splice(stub, Vec::new());
        }
    }

    /// Resolve a `Children` expansion with the flat `things` list from `morechildren`.
    pub fn resolve_children(&mut self, stub: usize, things: &[Value]) -> Result<()> {
        let stub_parent = self.stubs[stub].parent;
        let stub_parent_fullname = self.stubs[stub].parent_fullname.clone();
        let mut replacement = Vec::new();
        for thing in things {
            let parent_fullname = thing
                .get("data")
                .and_then(|d| d.get("parent_id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let (parent, into_replacement) = if parent_fullname == stub_parent_fullname {
                (stub_parent, true)
            } else if let Some(&p) = self.by_fullname.get(parent_fullname) {
                (Some(p), false)
            } else {
                tracing::warn!(
                    parent = parent_fullname,
                    stub = %self.stubs[stub].id,
                    "Expanded comment has unknown parent; keeping it under the stub's parent"
                );
                (stub_parent, true)
            };
            let Some(slot) = self.ingest_thing(parent, thing)? else {
                continue;
            };
            if let Slot::Comment(n) = slot {
                let nested = self.ingest_children(Some(n), replies_of(thing))?;
                self.nodes[n].slots.extend(nested);
            }
            if into_replacement {
                replacement.push(slot);
            } else if let Some(p) = parent {
                self.nodes[p].slots.push(slot);
            }
        }
        self.splice(stub, replacement);
        Ok(())
    }

    /// Resolve a `Continue` expansion with the comment listing of the focused
    /// permalink fetch; the focal comment's replies take the stub's place.
    pub fn resolve_continue(&mut self, stub: usize, listing: &Value) -> Result<()> {
        let comment_id = self.stubs[stub]
            .parent_fullname
            .trim_start_matches("t1_")
            .to_string();
        let parent = self.stubs[stub].parent;
        let focal = listing_children(listing).iter().find(|t| {
            t.get("data").and_then(|d| d.get("id")).and_then(Value::as_str) == Some(comment_id.as_str())
        });
        let replacement = match focal.and_then(|f| f.get("data")).and_then(|d| d.get("replies")) {
            Some(replies) => self.ingest_children(parent, listing_children(replies))?,
            None => {
                tracing::warn!(comment_id = %comment_id, "Focused fetch did not return the parent comment");
                Vec::new()
            }
        };
        self.splice(stub, replacement);
        Ok(())
    }

    /// Flatten the draft into a forest. Fails if any placeholder is still pending.
    pub fn finish(mut self) -> Result<CommentForest> {
        if let Some(stub) = self.stubs.iter().find(|s| !s.resolved) {
            return Err(RedditError::Parse(format!(
                "thread {} still has unexpanded comments under {}",
                self.link_id, stub.parent_fullname
            )));
        }
        let mut forest = CommentForest::new();
        let mut stack: Vec<(Option<usize>, Slot)> =
            self.root.iter().rev().map(|s| (None, *s)).collect();
        while let Some((parent, slot)) = stack.pop() {
            let Slot::Comment(n) = slot else { continue };
            let comment = std::mem::take(&mut self.nodes[n].comment);
            let idx = forest.push(parent, comment);
            stack.extend(self.nodes[n].slots.iter().rev().map(|s| (Some(idx), *s)));
        }
        Ok(forest)
    }

    fn ingest_children(&mut self, parent: Option<usize>, items: &[Value]) -> Result<Vec<Slot>> {
        let mut top = Vec::with_capacity(items.len());
        let mut stack: Vec<(usize, &[Value])> = Vec::new();
        for item in items {
            if let Some(slot) = self.ingest_thing(parent, item)? {
                top.push(slot);
                if let Slot::Comment(n) = slot {
                    stack.push((n, replies_of(item)));
                }
            }
        }
        while let Some((node, replies)) = stack.pop() {
            for item in replies {
                if let Some(slot) = self.ingest_thing(Some(node), item)? {
                    self.nodes[node].slots.push(slot);
                    if let Slot::Comment(n) = slot {
                        stack.push((n, replies_of(item)));
                    }
                }
            }
        }
        Ok(top)
    }

    /// Register one `t1` or `more` thing. Nested replies are left to the caller.
    /// Comments already seen (Reddit repeats some across expansions) yield `None`.
    fn ingest_thing(&mut self, parent: Option<usize>, thing: &Value) -> Result<Option<Slot>> {
        let kind = thing.get("kind").and_then(Value::as_str).unwrap_or_default();
        let Some(data) = thing.get("data") else {
            return Ok(None);
        };
        match kind {
            "t1" => {
                let raw = RawComment::deserialize(data)?;
                let fullname = format!("t1_{}", raw.id);
                if self.by_fullname.contains_key(&fullname) {
                    return Ok(None);
                }
                let author = raw.author.filter(|a| a != "[deleted]");
                let comment = Comment {
                    id: raw.id,
                    parent_id: raw.parent_id,
                    link_id: raw.link_id.unwrap_or_else(|| self.link_id.clone()),
                    author,
                    body: raw.body,
                    created_utc: raw.created_utc as i64,
                    score: raw.score,
                    depth: 0,
                };
                let n = self.nodes.len();
                self.nodes.push(DraftNode {
                    comment,
                    slots: Vec::new(),
                });
                self.by_fullname.insert(fullname, n);
                Ok(Some(Slot::Comment(n)))
            }
            "more" => {
                let raw = RawMore::deserialize(data)?;
                let s = self.stubs.len();
                self.stubs.push(MoreStub {
                    id: raw.id,
                    parent,
                    parent_fullname: raw.parent_id,
                    children: raw.children,
                    resolved: false,
                });
                Ok(Some(Slot::More(s)))
            }
            other => {
                tracing::debug!(kind = other, "Ignoring unexpected thing in comment listing");
                Ok(None)
            }
        }
    }

    fn splice(&mut self, stub: usize, replacement: Vec<Slot>) {
        self.stubs[stub].resolved = true;
        let slots = match self.stubs[stub].parent {
            Some(p) => &mut self.nodes[p].slots,
            None => &mut self.root,
        };
        if let Some(pos) = slots.iter().position(|s| *s == Slot::More(stub)) {
            slots.splice(pos..=pos, replacement);
        } else {
            slots.extend(replacement);
        }
    }
}

fn listing_children(listing: &Value) -> &[Value] {
    listing
        .get("data")
        .and_then(|d| d.get("children"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// `replies` is an empty string when a comment has none, a listing otherwise.
fn replies_of(thing: &Value) -> &[Value] {
    thing
        .get("data")
        .and_then(|d| d.get("replies"))
        .map(listing_children)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t1(id: &str, parent: &str, replies: Value) -> Value {
        json!({
            "kind": "t1",
            "data": {
                "id": id,
                "parent_id": parent,
                "link_id": "t3_post",
                "author": "someone",
                "body": format!("body of {id}"),
                "created_utc": 1_700_000_000.0,
                "score": 1,
                "replies": replies,
            }
        })
    }

    fn listing(children: Vec<Value>) -> Value {
        json!({ "kind": "Listing", "data": { "after": null, "children": children } })
    }

    fn more(id: &str, parent: &str, children: &[&str]) -> Value {
        json!({
            "kind": "more",
            "data": { "id": id, "parent_id": parent, "count": children.len(), "children": children }
        })
    }

    fn render(forest: &CommentForest) -> String {
        let mut buf = Vec::new();
        forest.write_json(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn ids(forest: &CommentForest) -> Vec<(String, u32)> {
        forest
            .preorder()
            .map(|(_, c)| (c.id.clone(), c.depth))
            .collect()
    }

    #[test]
    fn nested_listing_keeps_order_and_depth() {
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![
            t1(
                "a",
                "t3_post",
                listing(vec![t1("a1", "t1_a", json!("")), t1("a2", "t1_a", json!(""))]),
            ),
            t1("b", "t3_post", json!("")),
        ]))
        .unwrap();
        assert_eq!(b.next_pending(), None);
        let forest = b.finish().unwrap();
        assert_eq!(
            ids(&forest),
            vec![
                ("a".into(), 0),
                ("a1".into(), 1),
                ("a2".into(), 1),
                ("b".into(), 0)
            ]
        );
        assert_eq!(forest.roots().len(), 2);
        let a = forest.roots()[0];
        assert_eq!(forest.children(a).len(), 2);
        assert_eq!(forest.comment(forest.children(a)[1]).id, "a2");
    }

    #[test]
    fn deleted_author_becomes_none() {
        let mut item = t1("x", "t3_post", json!(""));
        item["data"]["author"] = json!("[deleted]");
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![item])).unwrap();
        let forest = b.finish().unwrap();
        assert_eq!(forest.comment(0).author, None);
    }

    #[test]
    fn more_stub_is_spliced_in_place() {
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![
            t1(
                "a",
                "t3_post",
                listing(vec![t1("a1", "t1_a", json!("")), more("m1", "t1_a", &["a2", "a3"])]),
            ),
            t1("b", "t3_post", json!("")),
        ]))
        .unwrap();

        let Some(Expansion::Children { stub, ids: wanted }) = b.next_pending() else {
            panic!("expected a children expansion");
        };
        assert_eq!(wanted, vec!["a2".to_string(), "a3".to_string()]);

        // morechildren returns a flat, pre-ordered list
        b.resolve_children(
            stub,
            &[
                t1("a2", "t1_a", json!("")),
                t1("a2x", "t1_a2", json!("")),
                t1("a3", "t1_a", json!("")),
            ],
        )
        .unwrap();
        assert_eq!(b.next_pending(), None);

        let forest = b.finish().unwrap();
        assert_eq!(
            ids(&forest),
            vec![
                ("a".into(), 0),
                ("a1".into(), 1),
                ("a2".into(), 1),
                ("a2x".into(), 2),
                ("a3".into(), 1),
                ("b".into(), 0)
            ]
        );
    }

    #[test]
    fn continue_thread_stub_uses_focal_replies() {
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![t1(
            "deep",
            "t3_post",
            listing(vec![more("_", "t1_deep", &[])]),
        )]))
        .unwrap();

        let Some(Expansion::Continue { stub, comment_id }) = b.next_pending() else {
            panic!("expected a continue expansion");
        };
        assert_eq!(comment_id, "deep");

        let focused = listing(vec![t1(
            "deep",
            "t3_post",
            listing(vec![t1("d1", "t1_deep", listing(vec![t1("d2", "t1_d1", json!(""))]))]),
        )]);
        b.resolve_continue(stub, &focused).unwrap();
        assert_eq!(b.next_pending(), None);

        let forest = b.finish().unwrap();
        assert_eq!(
            ids(&forest),
            vec![("deep".into(), 0), ("d1".into(), 1), ("d2".into(), 2)]
        );
    }

    #[test]
    fn repeated_comments_are_not_duplicated() {
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![
            t1("a", "t3_post", json!("")),
            more("m", "t3_post", &["a", "b"]),
        ]))
        .unwrap();
        let Some(Expansion::Children { stub, ids: wanted }) = b.next_pending() else {
            panic!("expected a children expansion");
        };
        assert_eq!(wanted, vec!["b".to_string()]);
        b.resolve_children(
            stub,
            &[t1("a", "t3_post", json!("")), t1("b", "t3_post", json!(""))],
        )
        .unwrap();
        let forest = b.finish().unwrap();
        assert_eq!(ids(&forest), vec![("a".into(), 0), ("b".into(), 0)]);
    }

    #[test]
    fn unexpanded_stub_blocks_finish() {
        let mut b = ThreadBuilder::new("t3_post");
        b.ingest_listing(&listing(vec![more("m", "t3_post", &["x"])]))
            .unwrap();
        assert!(b.finish().is_err());
    }

    #[test]
    fn very_deep_chain_builds_without_recursion() {
        let mut forest = CommentForest::new();
        let mut parent = None;
        for i in 0..50_000 {
            let idx = forest.push(
                parent,
                Comment {
                    id: format!("c{i}"),
                    ..Comment::default()
                },
            );
            parent = Some(idx);
        }
        assert_eq!(forest.max_depth(), Some(49_999));
        assert_eq!(forest.preorder().count(), 50_000);
    }

    #[test]
    fn writes_nested_replies() {
        let mut forest = CommentForest::new();
        let a = forest.push(
            None,
            Comment {
                id: "a".into(),
                ..Comment::default()
            },
        );
        forest.push(
            Some(a),
            Comment {
                id: "a1".into(),
                author: Some("bob".into()),
                ..Comment::default()
            },
        );
        let text = render(&forest);
        assert!(text.starts_with("[{\"id\":\"a\","));
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v[0]["id"], "a");
        assert_eq!(v[0]["depth"], 0);
        assert_eq!(v[0]["author"], Value::Null);
        assert_eq!(v[0]["replies"][0]["id"], "a1");
        assert_eq!(v[0]["replies"][0]["depth"], 1);
        assert_eq!(v[0]["replies"][0]["author"], "bob");
        assert_eq!(v[0]["replies"][0]["replies"], json!([]));
        assert_eq!(v.as_array().unwrap().len(), 1);
    }

    #[test]
    fn empty_forest_is_an_empty_array() {
        assert_eq!(render(&CommentForest::new()), "[]");
    }

    #[test]
    fn very_deep_chain_writes_without_recursion() {
        let mut forest = CommentForest::new();
        let mut parent = None;
        for i in 0..50_000 {
            parent = Some(forest.push(
                parent,
                Comment {
                    id: format!("c{i}"),
                    body: "quote \" and } inside".into(),
                    ..Comment::default()
                },
            ));
        }
        let text = render(&forest);
        assert!(text.starts_with("[{\"id\":\"c0\","));
        assert_eq!(text.matches("\"replies\":[").count(), 50_000);
        assert!(text.ends_with(&format!("{}]", "]}".repeat(50_000))));
        assert!(text.contains("\"id\":\"c49999\",\"parent_id\":\"\",\"link_id\":\"\",\"author\":null,\"body\":\"quote \\\" and } inside\",\"created_utc\":0,\"score\":0,\"depth\":49999,\"replies\":[]}"));
    }
}
