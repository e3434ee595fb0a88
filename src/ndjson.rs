use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::models::Submission;

/// Append-only NDJSON output: one complete thread per line.
pub struct NdjsonSink {
    file: File,
    path: PathBuf,
    /// The file ends in a torn line; start the next record on a fresh one.
    needs_newline: bool,
}

impl NdjsonSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("opening output {}", path.display()))?;
        let needs_newline = !ends_with_newline(&mut file)?;
        if needs_newline {
            tracing::warn!(path = %path.display(), "Output ends mid-record; the fragment will be left as is");
        }
        Ok(Self {
            file,
            path,
            needs_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one submission and append it as a single line, synced to disk.
    pub fn append(&mut self, submission: &Submission) -> Result<()> {
        let mut line = Vec::with_capacity(4096);
        if self.needs_newline {
            line.push(b'\n');
        }
        submission
            .write_json(&mut line)
            .with_context(|| format!("serializing thread {}", submission.id))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data())
            .with_context(|| format!("appending thread {} to {}", submission.id, self.path.display()))?;
        self.needs_newline = false;
        Ok(())
    }
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Ids of every complete record in an output file, in file order.
///
/// The file is streamed line by line. Only the leading `{"id":"…"` of each line is
/// decoded; completeness is checked by bracket balance, so deeply nested comment
/// forests never hit a recursion limit. Torn writes (no trailing newline, invalid
/// UTF-8, or an unbalanced object) are skipped.
pub fn read_record_ids(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut ids = Vec::new();
    loop {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        let Ok(line) = std::str::from_utf8(&raw) else {
            tracing::warn!(path = %path.display(), "Ignoring torn record (invalid UTF-8)");
            continue;
        };
        if let Some(id) = record_id(line, path) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn record_id(line: &str, path: &Path) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }
    if !line.ends_with('\n') || !is_complete_object(line) {
        tracing::warn!(path = %path.display(), "Ignoring torn record");
        return None;
    }
    let Some(rest) = line.trim_start().strip_prefix("{\"id\":") else {
        tracing::warn!(path = %path.display(), "Skipping line that is not a thread record");
        return None;
    };
    let mut de = serde_json::Deserializer::from_str(rest);
    match String::deserialize(&mut de) {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping record with unreadable id");
            None
        }
    }
}

/// True when `line` holds exactly one balanced JSON object.
fn is_complete_object(line: &str) -> bool {
    let body = line.trim();
    if !body.starts_with('{') || !body.ends_with('}') {
        return false;
    }
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in body.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 && i + 1 != body.len() {
                    return false;
                }
            }
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::CommentForest;

    fn submission(id: &str) -> Submission {
        Submission {
            id: id.into(),
            title: format!("title {id}"),
            selftext: String::new(),
            created_utc: 1_700_000_000,
            author: None,
            score: 1,
            num_comments: 0,
            link_flair_text: None,
            url: format!("https://reddit.com/{id}"),
            permalink: format!("/r/test/comments/{id}/"),
            comments: CommentForest::new(),
        }
    }

    #[test]
    fn appends_across_reopens_without_touching_prior_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");

        let mut sink = NdjsonSink::open(&path).unwrap();
        sink.append(&submission("p1")).unwrap();
        sink.append(&submission("p2")).unwrap();
        drop(sink);
        let first_run = std::fs::read_to_string(&path).unwrap();

        let mut sink = NdjsonSink::open(&path).unwrap();
        sink.append(&submission("p3")).unwrap();
        drop(sink);
        let second_run = std::fs::read_to_string(&path).unwrap();

        assert!(second_run.starts_with(&first_run));
        assert_eq!(second_run.lines().count(), 3);
        assert_eq!(read_record_ids(&path).unwrap(), vec!["p1", "p2", "p3"]);

        let v: serde_json::Value = serde_json::from_str(second_run.lines().last().unwrap()).unwrap();
        assert_eq!(v["title"], "title p3");
        assert!(v["comments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_skipped_and_next_record_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        std::fs::write(&path, "{\"id\":\"p1\",\"title\":\"t\"}\n{\"id\":\"p2\",\"tit").unwrap();

        assert_eq!(read_record_ids(&path).unwrap(), vec!["p1"]);

        let mut sink = NdjsonSink::open(&path).unwrap();
        sink.append(&submission("p3")).unwrap();
        drop(sink);

        assert_eq!(read_record_ids(&path).unwrap(), vec!["p1", "p3"]);
    }

    #[test]
    fn tail_cut_inside_a_multibyte_char_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let mut bytes = b"{\"id\":\"p1\",\"title\":\"t\"}\n{\"id\":\"p2\",\"body\":\"hi ".to_vec();
        bytes.extend_from_slice(&[0xF0, 0x9F]);
        std::fs::write(&path, &bytes).unwrap();

        assert_eq!(read_record_ids(&path).unwrap(), vec!["p1"]);

        let mut sink = NdjsonSink::open(&path).unwrap();
        sink.append(&submission("p3")).unwrap();
        drop(sink);
        assert_eq!(read_record_ids(&path).unwrap(), vec!["p1", "p3"]);
    }

    #[test]
    fn balance_check_ignores_brackets_inside_strings() {
        assert!(is_complete_object("{\"id\":\"a\",\"body\":\"}} ]] \\\" {\"}\n"));
        assert!(!is_complete_object("{\"id\":\"a\",\"comments\":[{\"id\":\"c\"}\n"));
        assert!(!is_complete_object("{\"id\":\"a\"}{\"id\":\"b\"}"));
    }

    #[test]
    fn missing_file_has_no_ids() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_record_ids(dir.path().join("nope.ndjson")).unwrap().is_empty());
    }
}
