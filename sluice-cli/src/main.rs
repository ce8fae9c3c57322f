use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sluice_engine::{
    Collaborators, ConcatMergeService, DownloadEngine, EngineConfig, EnqueueRequest,
    MemoryBlobStore, TaskStatus,
};

mod cli;
mod local;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(all_completed) => {
            if all_completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::Cli) -> sluice_engine::Result<bool> {
    let mut config = EngineConfig::default();
    config.limits.max_concurrent = args.max_concurrent.max(1);
    config.fetcher.wave_size = args.wave_size.max(1);

    let store = Arc::new(MemoryBlobStore::new());
    let merge = Arc::new(ConcatMergeService::new(store.clone()));
    let sink = Arc::new(local::FileSink::new(args.output_dir.clone()));
    let (notifier, remaining) = local::ConsoleNotifier::new(args.urls.len());

    let engine = DownloadEngine::new(
        config,
        Collaborators {
            store,
            merge,
            sink,
            notifier: Arc::new(notifier),
        },
    )?;

    let single = args.urls.len() == 1;
    let ids: Vec<_> = args
        .urls
        .iter()
        .map(|url| {
            engine.enqueue(EnqueueRequest {
                url: url.clone(),
                title: single.then(|| args.title.clone()).flatten(),
                password: args.password.clone(),
                ..Default::default()
            })
        })
        .collect();

    local::wait_for_drain(remaining).await;

    if args.snapshot {
        let snapshot = engine.snapshot();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "failed to serialize snapshot"),
        }
    }

    let all_completed = ids
        .iter()
        .all(|id| engine.registry().status_of(id) == Some(TaskStatus::Completed));
    Ok(all_completed)
}
