use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate};
use std::collections::HashSet;
use std::io;

use crate::forest::{CommentForest, write_field};

/// Lightweight listing metadata used to decide whether a thread is worth a full fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub id: String,
    pub created_utc: i64,
    pub score: i64,
    pub link_flair_text: Option<String>,
}

/// One thread: the post plus its fully expanded comment forest.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub title: String,
    pub selftext: String,
    pub created_utc: i64,
    pub author: Option<String>,
    pub score: i64,
    pub num_comments: i64,
    pub link_flair_text: Option<String>,
    pub url: String,
    pub permalink: String,
    pub comments: CommentForest,
}

impl Submission {
    /// Write the thread as one JSON object. `id` is always the first key; the
    /// comment forest is written without recursion.
    pub fn write_json<W: io::Write>(&self, out: &mut W) -> serde_json::Result<()> {
        out.write_all(b"{\"id\":").map_err(serde_json::Error::io)?;
        serde_json::to_writer(&mut *out, &self.id)?;
        write_field(out, "title", &self.title)?;
        write_field(out, "selftext", &self.selftext)?;
        write_field(out, "created_utc", &self.created_utc)?;
        write_field(out, "author", &self.author)?;
        write_field(out, "score", &self.score)?;
        write_field(out, "num_comments", &self.num_comments)?;
        write_field(out, "link_flair_text", &self.link_flair_text)?;
        write_field(out, "url", &self.url)?;
        write_field(out, "permalink", &self.permalink)?;
        out.write_all(b",\"comments\":").map_err(serde_json::Error::io)?;
        self.comments.write_json(out)?;
        out.write_all(b"}").map_err(serde_json::Error::io)
    }
}

/// Inclusive `[start, end]` in unix seconds. The end date covers its whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn from_dates(start: &str, end: &str) -> Result<Self> {
        let start_ts = parse_boundary(start)?;
        let end_ts = parse_boundary(end)? + 86_399;
        if end_ts < start_ts {
            return Err(anyhow!("end date {end} is before start date {start}"));
        }
        Ok(Self {
            start: start_ts,
            end: end_ts,
        })
    }

    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// A bare ISO date means midnight UTC; full RFC 3339 timestamps are taken as given.
fn parse_boundary(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = d
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("invalid date {s}"))?;
        return Ok(midnight.and_utc().timestamp());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|_| anyhow!("expected YYYY-MM-DD or an RFC 3339 timestamp, got {s:?}"))
}

/// Score threshold and flair allow-list applied to every discovery record.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub min_score: Option<i64>,
    flairs: Option<HashSet<String>>,
}

impl DiscoveryFilter {
    pub fn new(min_score: Option<i64>, flairs: Option<&[String]>) -> Self {
        let flairs = flairs
            .map(|fs| fs.iter().map(|f| f.trim().to_lowercase()).collect::<HashSet<_>>())
            .filter(|set| !set.is_empty());
        Self { min_score, flairs }
    }

    pub fn accepts(&self, rec: &DiscoveryRecord) -> bool {
        if self.min_score.is_some_and(|min| rec.score < min) {
            return false;
        }
        if let Some(allowed) = &self.flairs {
            let flair = rec.link_flair_text.as_deref().unwrap_or("").to_lowercase();
            if !allowed.contains(&flair) {
                return false;
            }
        }
        true
    }
}

/// The relative time buckets Reddit search understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TimeFilter {
    Hour,
    Day,
    Week,
    Month,
    #[default]
    Year,
    All,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Hour => "hour",
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Walk `/new` newest-first and stop once posts predate the window.
    Range(TimeWindow),
    /// Reddit search; dates are not honoured, only the coarse bucket.
    Keywords {
        keywords: Vec<String>,
        time_filter: TimeFilter,
    },
}

#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    pub subreddit: String,
    pub mode: DiscoveryMode,
    pub filter: DiscoveryFilter,
}

/// `"a" OR "b"`, each keyword quoted.
pub fn keyword_query(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| format!("\"{}\"", k.trim()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(score: i64, flair: Option<&str>) -> DiscoveryRecord {
        DiscoveryRecord {
            id: "x".into(),
            created_utc: 0,
            score,
            link_flair_text: flair.map(str::to_string),
        }
    }

    #[test]
    fn window_from_bare_dates() {
        let w = TimeWindow::from_dates("2024-01-01", "2024-01-31").unwrap();
        assert_eq!(w.start, 1_704_067_200);
        assert_eq!(w.end, 1_706_659_200 + 86_399);
        assert!(w.contains(w.end));
        assert!(!w.contains(w.end + 1));
        assert!(!w.contains(w.start - 1));
    }

    #[test]
    fn window_rejects_garbage_and_inverted_ranges() {
        assert!(TimeWindow::from_dates("yesterday", "2024-01-01").is_err());
        assert!(TimeWindow::from_dates("2024-02-01", "2024-01-01").is_err());
        assert!(TimeWindow::from_dates("2024-01-01T00:00:00Z", "2024-01-01").is_ok());
    }

    #[test]
    fn min_score_is_exclusive_below() {
        let f = DiscoveryFilter::new(Some(5), None);
        assert!(!f.accepts(&rec(3, None)));
        assert!(f.accepts(&rec(5, None)));
    }

    #[test]
    fn flair_allow_list_ignores_case() {
        let news = DiscoveryFilter::new(None, Some(&["News".to_string()]));
        assert!(!news.accepts(&rec(1, Some("Discussion"))));

        let discussion = DiscoveryFilter::new(None, Some(&["discussion".to_string()]));
        assert!(discussion.accepts(&rec(1, Some("Discussion"))));
        assert!(!discussion.accepts(&rec(1, None)));
    }

    #[test]
    fn empty_flair_list_disables_filter() {
        let f = DiscoveryFilter::new(None, Some(&[]));
        assert!(f.accepts(&rec(1, None)));
    }

    #[test]
    fn keyword_query_quotes_each_term() {
        let q = keyword_query(&["rust lang".to_string(), "tokio".to_string()]);
        assert_eq!(q, "\"rust lang\" OR \"tokio\"");
    }
}
