use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::CheckpointStore;
use crate::error::RedditError;
use crate::models::{DiscoveryRecord, Submission, TimeWindow};
use crate::ndjson::{NdjsonSink, read_record_ids};

/// Lazy source of candidate threads, newest first.
#[async_trait]
pub trait CandidateFeed: Send {
    async fn next_candidate(&mut self) -> Result<Option<DiscoveryRecord>, RedditError>;
}

/// Full-thread retrieval. Transient failures are the implementor's problem; any
/// error that reaches the harvester ends the run.
#[async_trait]
pub trait ThreadFetcher: Send + Sync {
    async fn fetch_thread(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Submission, RedditError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    Filtering,
    Fetching,
    Persisting,
    Checkpointing,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Discovering => "discovering",
            Phase::Filtering => "filtering",
            Phase::Fetching => "fetching",
            Phase::Persisting => "persisting",
            Phase::Checkpointing => "checkpointing",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// The feed ran dry; `saved` new threads were written.
    Completed { saved: usize },
    /// Cancelled part way; everything counted in `saved` is persisted and checkpointed.
    Aborted { saved: usize },
}

impl HarvestOutcome {
    pub fn saved(&self) -> usize {
        match *self {
            HarvestOutcome::Completed { saved } | HarvestOutcome::Aborted { saved } => saved,
        }
    }
}

/// Feed → checkpoint check → full fetch → NDJSON append → checkpoint, one thread at a time.
pub struct Harvester<F> {
    fetcher: F,
    store: CheckpointStore,
    sink: NdjsonSink,
    cancel: CancellationToken,
    exact_window: Option<TimeWindow>,
    pb: ProgressBar,
    phase: Phase,
}

impl<F: ThreadFetcher> Harvester<F> {
    pub fn new(
        fetcher: F,
        store: CheckpointStore,
        sink: NdjsonSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            store,
            sink,
            cancel,
            exact_window: None,
            pb: ProgressBar::hidden(),
            phase: Phase::Discovering,
        }
    }

    /// Drop fetched threads created outside `window` before they are written.
    pub fn with_exact_window(mut self, window: Option<TimeWindow>) -> Self {
        self.exact_window = window;
        self
    }

    pub fn with_spinner(mut self) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {pos} posts saved • {msg}") {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        self.pb = pb;
        self
    }

    /// Mark every id already present in the output as done. Covers a crash that
    /// landed between appending a record and checkpointing it.
    pub fn reconcile(&self) -> Result<usize> {
        let mut repaired = 0;
        for id in read_record_ids(self.sink.path())? {
            if !self.store.is_done(&id)? {
                self.store.mark_done(&id)?;
                repaired += 1;
            }
        }
        if repaired > 0 {
            tracing::warn!(repaired, "Checkpointed threads found in output but missing from the store");
        }
        Ok(repaired)
    }

    /// Drive the feed to completion or cancellation. The checkpoint store is closed
    /// on every exit path.
    pub async fn run(mut self, feed: &mut dyn CandidateFeed) -> Result<HarvestOutcome> {
        let result = self.drive(feed).await;
        let closed = self.store.close();
        self.pb.finish_and_clear();
        let outcome = result?;
        closed?;
        Ok(outcome)
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.pb.set_message(phase.to_string());
    }

    async fn drive(&mut self, feed: &mut dyn CandidateFeed) -> Result<HarvestOutcome> {
        let mut saved = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.abort(saved));
            }

            self.enter(Phase::Discovering);
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(self.abort(saved)),
                r = feed.next_candidate() => r,
            };
            let candidate = match next {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(RedditError::Cancelled) => return Ok(self.abort(saved)),
                Err(e) => return Err(e).context("listing candidate threads"),
            };

            self.enter(Phase::Filtering);
            if self.store.is_done(&candidate.id)? {
                tracing::debug!(id = %candidate.id, "Skip already-scraped thread");
                continue;
            }

            self.enter(Phase::Fetching);
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(self.abort(saved)),
                r = self.fetcher.fetch_thread(&candidate.id, &self.cancel) => r,
            };
            let submission = match fetched {
                Ok(s) => s,
                Err(RedditError::Cancelled) => return Ok(self.abort(saved)),
                Err(e) => {
                    return Err(e).with_context(|| format!("fetching thread {}", candidate.id));
                }
            };

            if let Some(window) = &self.exact_window {
                if !window.contains(submission.created_utc) {
                    tracing::debug!(
                        id = %submission.id,
                        created_utc = submission.created_utc,
                        "Outside requested dates, not saved"
                    );
                    continue;
                }
            }

            // No cancellation checks from here to the checkpoint: both steps are local
            // and short, and splitting them is what produces duplicate records.
            self.enter(Phase::Persisting);
            self.sink.append(&submission)?;

            self.enter(Phase::Checkpointing);
            self.store.mark_done(&candidate.id)?;

            saved += 1;
            self.pb.inc(1);
            tracing::debug!(
                id = %submission.id,
                comments = submission.comments.len(),
                saved,
                "Saved thread"
            );
            if saved % 25 == 0 {
                tracing::info!(saved, "Progress");
            }
        }

        self.enter(Phase::Done);
        tracing::info!(saved, "Scraping finished");
        Ok(HarvestOutcome::Completed { saved })
    }

    fn abort(&mut self, saved: usize) -> HarvestOutcome {
        tracing::warn!(saved, interrupted = %self.phase, "Cancelled, shutting down");
        self.enter(Phase::Aborted);
        HarvestOutcome::Aborted { saved }
    }
}
