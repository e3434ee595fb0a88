use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use subreddit_harvester::cli::{Args, LogFormat, OutputLayout};
use subreddit_harvester::config::RedditCredentials;
use subreddit_harvester::db::CheckpointStore;
use subreddit_harvester::harvester::{HarvestOutcome, Harvester};
use subreddit_harvester::ndjson::NdjsonSink;
use subreddit_harvester::reddit::RedditClient;
use subreddit_harvester::throttle::Throttle;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("[LOG] {e:#}");
        std::process::exit(2);
    }

    match run(args).await {
        Ok(HarvestOutcome::Completed { saved: 0 }) => {
            tracing::info!("No new posts were saved");
        }
        Ok(HarvestOutcome::Completed { saved }) => {
            tracing::info!(saved, "Done");
        }
        Ok(HarvestOutcome::Aborted { saved }) => {
            tracing::warn!(saved, "Stopped early; rerun the same command to resume");
        }
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<HarvestOutcome> {
    let query = args.query()?;
    let exact_window = args.exact_window()?;
    let tag = args.tag();
    let layout = OutputLayout::new(&args.out_dir, &tag);
    layout.create_dirs()?;

    let creds = RedditCredentials::from_env().context("loading Reddit credentials")?;
    let client = RedditClient::new(creds, Throttle::per_minute(args.rpm), args.retry_policy())?;

    let cancel = CancellationToken::new();
    spawn_shutdown(cancel.clone());

    let store = CheckpointStore::open(&layout.progress, &tag)?;
    let sink = NdjsonSink::open(&layout.data)?;
    tracing::info!(
        tag = %tag,
        output = %layout.data.display(),
        already_done = store.count()?,
        "Starting scrape"
    );

    let harvester = Harvester::new(client.clone(), store, sink, cancel.clone())
        .with_exact_window(exact_window)
        .with_spinner();
    if !args.no_reconcile {
        harvester.reconcile()?;
    }

    let mut feed = client.discover(query, cancel);
    harvester.run(&mut feed).await
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("invalid --log-level {:?}", args.log_level))?,
    };
    let (writer, ansi) = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false);
    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

/// Ctrl-C or SIGTERM cancels the run; the harvester finishes its current step and exits.
fn spawn_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::warn!("Shutdown requested");
        cancel.cancel();
    });
}
