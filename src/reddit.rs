use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RedditCredentials;
use crate::discovery::FeedPager;
use crate::error::{RedditError, Result};
use crate::forest::{Expansion, ThreadBuilder};
use crate::harvester::ThreadFetcher;
use crate::models::{DiscoveryQuery, Submission};
use crate::retry::{RetryPolicy, with_retry};
use crate::throttle::Throttle;

const AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";

/// Largest batch `morechildren` accepts.
const MORECHILDREN_BATCH: usize = 100;

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth_url: String,
    pub api_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_url: AUTH_URL.to_string(),
            api_base: API_BASE.to_string(),
        }
    }
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_ttl")]
    expires_in: u64,
}

fn default_token_ttl() -> u64 {
    3600
}

/// Generic Reddit listing envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct Listing<T> {
    pub data: ListingData<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListingData<T> {
    pub after: Option<String>,
    #[serde(default = "Vec::new")]
    pub children: Vec<Thing<T>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Thing<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
struct PostData {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    #[serde(default)]
    created_utc: f64,
    author: Option<String>,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
    link_flair_text: Option<String>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    permalink: String,
}

/// All Reddit traffic: candidate discovery and full thread retrieval.
#[derive(Clone)]
pub struct RedditClient {
    http: reqwest::Client,
    creds: Arc<RedditCredentials>,
    endpoints: Arc<Endpoints>,
    token: Arc<Mutex<Option<AccessToken>>>,
    throttle: Throttle,
    retry: RetryPolicy,
}

impl RedditClient {
    pub fn new(creds: RedditCredentials, throttle: Throttle, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(creds.user_agent.clone())
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            creds: Arc::new(creds),
            endpoints: Arc::new(Endpoints::default()),
            token: Arc::new(Mutex::new(None)),
            throttle,
            retry,
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Arc::new(endpoints);
        self
    }

    /// Lazy candidate sequence for `query`, one listing page at a time.
    pub fn discover(&self, query: DiscoveryQuery, cancel: CancellationToken) -> FeedPager {
        FeedPager::new(self.clone(), query, cancel)
    }

    async fn bearer(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(tok) = guard.as_ref() {
            if tok.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(tok.value.clone());
            }
        }

        self.throttle.gate().await;
        let resp = self
            .http
            .post(&self.endpoints.auth_url)
            .basic_auth(&self.creds.client_id, Some(&self.creds.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => RedditError::Auth(format!("status {status}: {body}")),
                s => RedditError::from_status(s, body, None),
            });
        }

        let token: TokenResponse = resp.json().await?;
        tracing::debug!(expires_in = token.expires_in, "Obtained Reddit access token");
        let value = token.access_token.clone();
        *guard = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn get_json_once(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let bearer = self.bearer().await?;
        self.throttle.gate().await;

        let url = format!("{}{}", self.endpoints.api_base, path);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&bearer)
            .query(query)
            .query(&[("raw_json", "1")])
            .send()
            .await?;

        self.observe_rate_limit(resp.headers());

        let status = resp.status();
        if !status.is_success() {
            let retry_after = header_secs(resp.headers(), "retry-after").map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            let err = RedditError::from_status(status.as_u16(), format!("{path}: {body}"), retry_after);
            if matches!(err, RedditError::TokenExpired) {
                *self.token.lock().await = None;
            }
            if let Some(wait) = retry_after {
                self.throttle.cool_down(wait.as_secs());
            }
            return Err(err);
        }

        Ok(resp.json().await?)
    }

    /// GET with the configured retry policy; only non-transient errors escape.
    pub(crate) async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        with_retry(self.retry, cancel, path, || self.get_json_once(path, query)).await
    }

    fn observe_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<f64>().ok());
        if remaining.is_some_and(|r| r < 1.0) {
            let reset = header_secs(headers, "x-ratelimit-reset").unwrap_or(60);
            tracing::warn!(reset_secs = reset, "Rate-limit budget spent, cooling down");
            self.throttle.cool_down(reset);
        }
    }

    /// Fetch one thread with every collapsed branch expanded.
    pub async fn fetch_thread(&self, id: &str, cancel: &CancellationToken) -> Result<Submission> {
        let page = self
            .get_json(&format!("/comments/{id}"), &[("limit", "500".to_string())], cancel)
            .await?;
        let (post_listing, comment_listing) = match page.as_array().map(Vec::as_slice) {
            Some([post, comments, ..]) => (post, comments),
            _ => {
                return Err(RedditError::Parse(format!(
                    "thread {id}: expected [post, comments] listing pair"
                )));
            }
        };

        let post = Listing::<PostData>::deserialize(post_listing)?
            .data
            .children
            .into_iter()
            .next()
            .ok_or_else(|| RedditError::NotFound(format!("thread {id} has no post")))?
            .data;

        let link_id = format!("t3_{}", post.id);
        let mut builder = ThreadBuilder::new(&link_id);
        builder.ingest_listing(comment_listing)?;

        let mut expansions = 0u32;
        while let Some(expansion) = builder.next_pending() {
            match expansion {
                Expansion::Children { stub, ids } => {
                    let mut things = Vec::with_capacity(ids.len());
                    for chunk in ids.chunks(MORECHILDREN_BATCH) {
                        things.extend(self.more_children(&link_id, chunk, cancel).await?);
                    }
                    builder.resolve_children(stub, &things)?;
                }
                Expansion::Continue { stub, comment_id } => {
                    let focused = self
                        .get_json(
                            &format!("/comments/{}", post.id),
                            &[("comment", comment_id), ("limit", "500".to_string())],
                            cancel,
                        )
                        .await?;
                    let listing = focused.get(1).ok_or_else(|| {
                        RedditError::Parse(format!("thread {id}: focused fetch missing comments"))
                    })?;
                    builder.resolve_continue(stub, listing)?;
                }
            }
            expansions += 1;
        }

        let comments = builder.finish()?;
        tracing::debug!(
            id,
            comments = comments.len(),
            max_depth = ?comments.max_depth(),
            declared = post.num_comments,
            expansions,
            "Fetched thread"
        );

        Ok(Submission {
            id: post.id,
            title: post.title,
            selftext: post.selftext,
            created_utc: post.created_utc as i64,
            author: post.author.filter(|a| a != "[deleted]"),
            score: post.score,
            num_comments: post.num_comments,
            link_flair_text: post.link_flair_text,
            url: post.url,
            permalink: post.permalink,
            comments,
        })
    }

    async fn more_children(
        &self,
        link_id: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let v = self
            .get_json(
                "/api/morechildren",
                &[
                    ("api_type", "json".to_string()),
                    ("link_id", link_id.to_string()),
                    ("children", ids.join(",")),
                    ("limit_children", "false".to_string()),
                ],
                cancel,
            )
            .await?;
        let json = v.get("json").ok_or_else(|| RedditError::Parse("morechildren: no json".into()))?;
        if let Some(errors) = json.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(RedditError::Api {
                    status: 200,
                    message: format!("morechildren for {link_id}: {errors:?}"),
                });
            }
        }
        Ok(json
            .get("data")
            .and_then(|d| d.get("things"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ThreadFetcher for RedditClient {
    async fn fetch_thread(&self, id: &str, cancel: &CancellationToken) -> Result<Submission> {
        RedditClient::fetch_thread(self, id, cancel).await
    }
}

fn header_secs(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|f| f.ceil().max(0.0) as u64)
}
