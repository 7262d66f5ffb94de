use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod config;
mod http_server;
mod ledger_client;
mod object_store_client;

use archivist_core::ContentId;
use archivist_node::messages::{self, UploadRequest, VerifyChunk};
use archivist_node::{run_consumer, BackpressureController, BatchUploader, Reuploader};
use archivist_queue::amqp::AmqpBroker;
use archivist_queue::DelayedQueue;

use crate::config::WorkerConfig;
use crate::http_server::WorkerAppState;
use crate::ledger_client::GatewayLedger;
use crate::object_store_client::HttpObjectStore;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml, .yaml, .json or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the upload and reupload consumers (default)
    Run,
    /// Publish an upload request for a stored chunk
    Enqueue {
        /// Content id of the chunk in the object store
        chunk_id: String,
    },
    /// Schedule an immediate confirmation check for chunks
    Verify {
        #[arg(required = true)]
        chunk_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("ARCHIVIST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match WorkerConfig::new(cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Enqueue { chunk_id }) => {
            let ids = parse_chunk_ids(&[chunk_id]);
            let broker = connect_broker(&config).await;
            let queue = DelayedQueue::new(broker.clone());
            for id in ids {
                let request = UploadRequest::with_integration_fields(id.clone());
                if let Err(err) = queue.publish_now(messages::UPLOAD, &request).await {
                    error!("enqueue {id} failed: {err}");
                    std::process::exit(1);
                }
                println!("queued {id}");
            }
            close_broker(&broker).await;
        }
        Some(Commands::Verify { chunk_ids }) => {
            let ids = parse_chunk_ids(&chunk_ids);
            let broker = connect_broker(&config).await;
            let queue = DelayedQueue::new(broker.clone());
            for id in ids {
                let check = VerifyChunk::now(UploadRequest::with_integration_fields(id.clone()));
                if let Err(err) = queue
                    .publish_delayed(messages::VERIFY_CHUNK_ID, &check, Duration::ZERO)
                    .await
                {
                    error!("verify {id} failed: {err}");
                    std::process::exit(1);
                }
                println!("scheduled {id}");
            }
            close_broker(&broker).await;
        }
        Some(Commands::Run) | None => {
            let stop = run(config).await;
            let code = stop.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Signal,
    ConsumerLost(&'static str),
}

impl Stop {
    /// A lost consumer exits non-zero so the supervisor restarts the worker.
    fn exit_code(self) -> i32 {
        match self {
            Stop::Signal => 0,
            Stop::ConsumerLost(_) => 1,
        }
    }
}

fn parse_chunk_ids(raw: &[String]) -> Vec<ContentId> {
    raw.iter()
        .map(|value| match ContentId::parse(value) {
            Ok(id) => id,
            Err(err) => {
                error!("invalid chunk id {value:?}: {err}");
                std::process::exit(2);
            }
        })
        .collect()
}

async fn connect_broker(config: &WorkerConfig) -> Arc<AmqpBroker> {
    match AmqpBroker::connect(&config.broker_url).await {
        Ok(broker) => Arc::new(broker),
        Err(err) => {
            error!("broker connect failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn close_broker(broker: &AmqpBroker) {
    if let Err(err) = broker.close().await {
        warn!("broker close failed: {err}");
    }
}

async fn run(config: WorkerConfig) -> Stop {
    let ledger = match GatewayLedger::new(&config.ledger_gateway_url, config.request_timeout) {
        Ok(ledger) => Arc::new(ledger),
        Err(err) => {
            error!("ledger client init failed: {err}");
            std::process::exit(1);
        }
    };
    let credentials = config
        .object_store_access_key
        .clone()
        .zip(config.object_store_secret_key.clone());
    let store = match HttpObjectStore::new(
        &config.object_store_endpoint,
        &config.object_store_bucket,
        credentials,
        config.request_timeout,
    ) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("object store client init failed: {err}");
            std::process::exit(1);
        }
    };

    let broker = connect_broker(&config).await;
    let queue = DelayedQueue::new(broker.clone());
    let backpressure = BackpressureController::new();
    let uploader_config = config.uploader();
    let intake_source = uploader_config.intake_source.clone();
    let prefetch = uploader_config.intake_prefetch(config.max_concurrency);

    let uploader = BatchUploader::new(
        queue.clone(),
        store.clone(),
        ledger.clone(),
        backpressure.clone(),
        uploader_config,
    );
    let reuploader = Arc::new(Reuploader::new(
        queue.clone(),
        store,
        ledger,
        config.reupload(),
    ));

    let upload_subscription = match queue.subscribe(messages::UPLOAD, prefetch).await {
        Ok(subscription) => subscription,
        Err(err) => {
            error!("subscribe to {} failed: {err}", messages::UPLOAD);
            std::process::exit(1);
        }
    };
    let reupload_subscription = match queue.subscribe_delayed(messages::REUPLOAD, 1).await {
        Ok(subscription) => subscription,
        Err(err) => {
            error!("subscribe to {} failed: {err}", messages::REUPLOAD);
            std::process::exit(1);
        }
    };

    let upload_handler = Arc::clone(&uploader);
    let mut upload_task = tokio::spawn(run_consumer(
        upload_subscription,
        Some(backpressure.gate(&intake_source)),
        config.max_concurrency,
        move |delivery| {
            let uploader = Arc::clone(&upload_handler);
            async move {
                let outcome = uploader.handle_upload(delivery).await;
                debug!("upload: {outcome:?}");
            }
        },
    ));
    let mut reupload_task = tokio::spawn(run_consumer(
        reupload_subscription,
        None,
        1,
        move |delivery| {
            let reuploader = Arc::clone(&reuploader);
            async move {
                let outcome = reuploader.handle(delivery).await;
                debug!("reupload: {outcome:?}");
            }
        },
    ));

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    if config.health_port != 0 {
        let state = WorkerAppState {
            broker: broker.clone(),
            uploader: Arc::clone(&uploader),
            backpressure: backpressure.clone(),
        };
        if let Some(handle) = start_health_server(&config, state).await {
            background.push(handle);
        }
    }
    if let Some(url) = config.keep_alive_url.clone() {
        background.push(tokio::spawn(keep_alive(
            url,
            config.keep_alive_interval,
            config.request_timeout,
        )));
    }

    info!(
        "archivist worker running (batch size {}, concurrency {}, prefetch {prefetch})",
        uploader.config().max_batch_size,
        config.max_concurrency
    );

    let stop = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("signal handler failed: {err}");
            }
            info!("shutdown requested");
            Stop::Signal
        }
        _ = &mut upload_task => Stop::ConsumerLost(messages::UPLOAD),
        _ = &mut reupload_task => Stop::ConsumerLost(messages::REUPLOAD),
    };
    if let Stop::ConsumerLost(topic) = stop {
        error!("{topic} consumer stopped, shutting down");
    }

    upload_task.abort();
    reupload_task.abort();
    for handle in background {
        handle.abort();
    }
    // Unsettled deliveries, including any still pooled, return to their queues.
    close_broker(&broker).await;
    info!("archivist worker stopped");
    stop
}

async fn start_health_server(config: &WorkerConfig, state: WorkerAppState) -> Option<JoinHandle<()>> {
    let bind_addr = format!("{}:{}", config.health_bind, config.health_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("health server bind failed on {bind_addr}: {err}");
            return None;
        }
    };
    info!("health server listening on {bind_addr}");
    let router = http_server::build_router(state);
    Some(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!("health server error: {err}");
        }
    }))
}

/// Requests `url` every `interval` so hosts that idle out unused dynos keep
/// the worker alive.
async fn keep_alive(url: String, interval: Duration, timeout: Duration) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => {
            error!("keep-alive client init failed: {err}");
            return;
        }
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match client.get(&url).send().await {
            Ok(response) => debug!("keep-alive: {url} -> {}", response.status()),
            Err(err) => warn!("keep-alive: {url} failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, Stop};

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["archivist-worker"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn enqueue_and_verify_take_chunk_ids() {
        let id = "ab".repeat(32);
        let cli = Cli::try_parse_from(["archivist-worker", "-c", "worker.toml", "enqueue", &id])
            .expect("parse enqueue");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("worker.toml")));
        assert_eq!(cli.command, Some(Commands::Enqueue { chunk_id: id.clone() }));

        let cli = Cli::try_parse_from(["archivist-worker", "verify", &id, &id]).expect("parse verify");
        assert_eq!(
            cli.command,
            Some(Commands::Verify {
                chunk_ids: vec![id.clone(), id]
            })
        );
    }

    #[test]
    fn lost_consumer_exits_non_zero() {
        assert_eq!(Stop::Signal.exit_code(), 0);
        assert_eq!(Stop::ConsumerLost("upload").exit_code(), 1);
        assert_eq!(Stop::ConsumerLost("reupload").exit_code(), 1);
    }

    #[test]
    fn verify_requires_at_least_one_chunk() {
        assert!(Cli::try_parse_from(["archivist-worker", "verify"]).is_err());
    }
}
