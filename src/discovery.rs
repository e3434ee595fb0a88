use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::harvester::CandidateFeed;
use crate::models::{DiscoveryMode, DiscoveryQuery, DiscoveryRecord, keyword_query};
use crate::reddit::{Listing, RedditClient};

const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct PostSummary {
    id: String,
    #[serde(default)]
    created_utc: f64,
    #[serde(default)]
    score: i64,
    link_flair_text: Option<String>,
}

/// Pulls listing pages on demand and yields the records that pass the query's
/// window and filters. In range mode the first record older than the window ends
/// the feed for good: `/new` is newest-first, so nothing after it can match.
pub struct FeedPager {
    client: RedditClient,
    query: DiscoveryQuery,
    cancel: CancellationToken,
    after: Option<String>,
    buffer: VecDeque<DiscoveryRecord>,
    exhausted: bool,
    pages: u32,
}

impl FeedPager {
    pub(crate) fn new(client: RedditClient, query: DiscoveryQuery, cancel: CancellationToken) -> Self {
        Self {
            client,
            query,
            cancel,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages: 0,
        }
    }

    fn request(&self) -> (String, Vec<(&'static str, String)>) {
        let sub = &self.query.subreddit;
        let (path, mut params) = match &self.query.mode {
            DiscoveryMode::Range(_) => (
                format!("/r/{sub}/new"),
                vec![("limit", PAGE_SIZE.to_string())],
            ),
            DiscoveryMode::Keywords {
                keywords,
                time_filter,
            } => (
                format!("/r/{sub}/search"),
                vec![
                    ("q", keyword_query(keywords)),
                    ("restrict_sr", "1".to_string()),
                    ("sort", "new".to_string()),
                    ("t", time_filter.as_str().to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                ],
            ),
        };
        if let Some(after) = &self.after {
            params.push(("after", after.clone()));
        }
        (path, params)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let (path, params) = self.request();
        let page = self.client.get_json(&path, &params, &self.cancel).await?;
        let listing = Listing::<PostSummary>::deserialize(&page)?;
        self.pages += 1;

        let fetched = listing.data.children.len();
        self.after = listing.data.after;
        if fetched == 0 || self.after.is_none() {
            self.exhausted = true;
        }
        self.buffer
            .extend(listing.data.children.into_iter().map(|t| DiscoveryRecord {
                id: t.data.id,
                created_utc: t.data.created_utc as i64,
                score: t.data.score,
                link_flair_text: t.data.link_flair_text,
            }));
        tracing::debug!(
            subreddit = %self.query.subreddit,
            page = self.pages,
            fetched,
            last_page = self.exhausted,
            "Fetched listing page"
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.exhausted = true;
        self.buffer.clear();
    }
}

#[async_trait]
impl CandidateFeed for FeedPager {
    async fn next_candidate(&mut self) -> Result<Option<DiscoveryRecord>> {
        loop {
            while let Some(rec) = self.buffer.pop_front() {
                if let DiscoveryMode::Range(window) = &self.query.mode {
                    if rec.created_utc < window.start {
                        tracing::debug!(id = %rec.id, created_utc = rec.created_utc, "Reached start of window");
                        self.stop();
                        return Ok(None);
                    }
                    if rec.created_utc > window.end {
                        continue;
                    }
                }
                if !self.query.filter.accepts(&rec) {
                    tracing::trace!(id = %rec.id, score = rec.score, "Filtered out");
                    continue;
                }
                return Ok(Some(rec));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiscoveryFilter, TimeFilter, TimeWindow};
    use crate::reddit::tests::{client_for, fast_retry};
    use serde_json::{Value, json};
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(posts: &[(&str, i64, i64, Option<&str>)], after: Option<&str>) -> Value {
        let children: Vec<Value> = posts
            .iter()
            .map(|(id, ts, score, flair)| {
                json!({ "kind": "t3", "data": {
                    "id": id, "created_utc": *ts as f64, "score": score, "link_flair_text": flair
                }})
            })
            .collect();
        json!({ "kind": "Listing", "data": { "after": after, "children": children } })
    }

    async fn drain(feed: &mut FeedPager) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(rec) = feed.next_candidate().await.unwrap() {
            out.push(rec.id);
        }
        out
    }

    #[tokio::test]
    async fn range_mode_stops_at_window_start_without_more_calls() {
        let server = MockServer::start().await;
        let client = client_for(&server, fast_retry()).await;

        Mock::given(method("GET"))
            .and(path("/r/test/new"))
            .and(query_param_is_missing("after"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &[("a", 100, 1, None), ("b", 90, 1, None)],
                Some("t3_b"),
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/test/new"))
            .and(query_param("after", "t3_b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &[("c", 50, 1, None), ("d", 10, 1, None)],
                Some("t3_d"),
            )))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/test/new"))
            .and(query_param("after", "t3_d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(&[], None)))
            .expect(0)
            .mount(&server)
            .await;

        let query = DiscoveryQuery {
            subreddit: "test".into(),
            mode: DiscoveryMode::Range(TimeWindow { start: 60, end: 1_000 }),
            filter: DiscoveryFilter::default(),
        };
        let mut feed = client.discover(query, CancellationToken::new());
        assert_eq!(drain(&mut feed).await, vec!["a", "b"]);
        assert!(feed.next_candidate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_mode_skips_posts_newer_than_window() {
        let server = MockServer::start().await;
        let client = client_for(&server, fast_retry()).await;

        Mock::given(method("GET"))
            .and(path("/r/test/new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &[("new", 5_000, 1, None), ("in", 500, 1, None), ("old", 5, 1, None)],
                Some("t3_old"),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let query = DiscoveryQuery {
            subreddit: "test".into(),
            mode: DiscoveryMode::Range(TimeWindow { start: 60, end: 1_000 }),
            filter: DiscoveryFilter::default(),
        };
        let mut feed = client.discover(query, CancellationToken::new());
        assert_eq!(drain(&mut feed).await, vec!["in"]);
    }

    #[tokio::test]
    async fn keyword_mode_searches_and_filters() {
        let server = MockServer::start().await;
        let client = client_for(&server, fast_retry()).await;

        Mock::given(method("GET"))
            .and(path("/r/test/search"))
            .and(query_param("q", "\"rust\" OR \"tokio\""))
            .and(query_param("sort", "new"))
            .and(query_param("t", "month"))
            .and(query_param("restrict_sr", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(
                &[
                    ("low", 300, 3, Some("News")),
                    ("news", 200, 9, Some("News")),
                    ("chat", 100, 9, Some("Discussion")),
                    ("bare", 50, 9, None),
                ],
                None,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let query = DiscoveryQuery {
            subreddit: "test".into(),
            mode: DiscoveryMode::Keywords {
                keywords: vec!["rust".into(), "tokio".into()],
                time_filter: TimeFilter::Month,
            },
            filter: DiscoveryFilter::new(Some(5), Some(&["discussion".to_string()])),
        };
        let mut feed = client.discover(query, CancellationToken::new());
        assert_eq!(drain(&mut feed).await, vec!["chat"]);
    }
}
