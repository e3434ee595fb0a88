use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::models::{DiscoveryFilter, DiscoveryMode, DiscoveryQuery, TimeFilter, TimeWindow};
use crate::retry::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Resumable subreddit harvester (Reddit API → NDJSON) with 429 safety")]
pub struct Args {
    /// Subreddit name, without the r/ prefix.
    pub subreddit: String,

    /// First day to collect (YYYY-MM-DD, UTC).
    pub start_date: String,

    /// Last day to collect, inclusive.
    pub end_date: String,

    #[arg(long)]
    pub min_score: Option<i64>,

    /// Comma separated flair allow-list, matched case-insensitively.
    #[arg(long, value_delimiter = ',')]
    pub flair: Vec<String>,

    /// Comma separated keywords; switches discovery to Reddit search.
    #[arg(long, value_delimiter = ',')]
    pub keywords: Vec<String>,

    #[arg(long, value_enum, default_value_t = TimeFilter::Year)]
    pub time_filter: TimeFilter,

    /// In keyword mode, drop threads created outside the start/end dates.
    #[arg(long, default_value_t = false)]
    pub exact_range: bool,

    #[arg(long, env = "HARVEST_OUT_DIR", default_value = "outputs")]
    pub out_dir: PathBuf,

    #[arg(long, default_value_t = 60)]
    pub rpm: u32,

    /// 0 retries transient failures forever.
    #[arg(long, default_value_t = 0)]
    pub retry_attempts: u32,

    /// Seconds to wait before the first retry.
    #[arg(long, default_value_t = 2.0)]
    pub retry_backoff: f64,

    /// Upper bound on the retry wait; anything above `--retry-backoff` makes it grow.
    #[arg(long, default_value_t = 2.0)]
    pub retry_max_backoff: f64,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Write logs here instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Skip marking ids already present in the output as done.
    #[arg(long, default_value_t = false)]
    pub no_reconcile: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Args {
    pub fn window(&self) -> Result<TimeWindow> {
        TimeWindow::from_dates(&self.start_date, &self.end_date)
    }

    fn keywords(&self) -> Vec<String> {
        self.keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn query(&self) -> Result<DiscoveryQuery> {
        let window = self.window()?;
        let keywords = self.keywords();
        let mode = if keywords.is_empty() {
            DiscoveryMode::Range(window)
        } else {
            DiscoveryMode::Keywords {
                keywords,
                time_filter: self.time_filter,
            }
        };
        let flairs: Vec<String> = self.flair.iter().filter(|f| !f.trim().is_empty()).cloned().collect();
        Ok(DiscoveryQuery {
            subreddit: self.subreddit.trim().trim_start_matches("r/").to_string(),
            mode,
            filter: DiscoveryFilter::new(self.min_score, Some(flairs.as_slice())),
        })
    }

    /// The post-fetch window, only when keyword mode asked for it.
    pub fn exact_window(&self) -> Result<Option<TimeWindow>> {
        if self.exact_range && !self.keywords().is_empty() {
            Ok(Some(self.window()?))
        } else {
            Ok(None)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial_ms = secs_to_ms(self.retry_backoff);
        let max_ms = secs_to_ms(self.retry_max_backoff).max(initial_ms);
        RetryPolicy {
            attempts: (self.retry_attempts > 0).then_some(self.retry_attempts),
            initial_ms,
            max_ms,
            multiplier: if max_ms > initial_ms { 2.0 } else { 1.0 },
        }
    }

    pub fn tag(&self) -> String {
        let mut tag = format!(
            "{}_{}__{}",
            self.subreddit.trim().trim_start_matches("r/"),
            self.start_date.replace('-', "_"),
            self.end_date.replace('-', "_")
        );
        let keywords = self.keywords();
        if !keywords.is_empty() {
            let slug = slugify(&keywords);
            let digest = keyword_digest(&keywords);
            if slug.is_empty() {
                tag.push_str(&format!("__q_{digest}_{}", self.time_filter.as_str()));
            } else {
                tag.push_str(&format!("__q_{slug}_{digest}_{}", self.time_filter.as_str()));
            }
        }
        tag
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0) as u64
}

fn slugify(keywords: &[String]) -> String {
    let mut slug = String::new();
    for c in keywords.join("_").to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

/// First 8 hex chars of a SHA-256 over the lowercased, sorted keyword set. The slug
/// alone is lossy (`C++` and `C` both slug to `c`); the digest keeps such queries apart.
fn keyword_digest(keywords: &[String]) -> String {
    let mut normalized: Vec<String> = keywords.iter().map(|k| k.trim().to_lowercase()).collect();
    normalized.sort();
    normalized.dedup();
    let mut hasher = Sha256::new();
    for k in &normalized {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize()[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Where one scrape keeps its output and progress.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub data: PathBuf,
    pub progress: PathBuf,
}

impl OutputLayout {
    pub fn new(out_dir: &Path, tag: &str) -> Self {
        Self {
            data: out_dir.join("data").join(format!("output_{tag}.ndjson")),
            progress: out_dir.join("progress").join(format!("progress_{tag}.duckdb")),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for file in [&self.data, &self.progress] {
            if let Some(dir) = file.parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        Ok(())
    }
}
