//! # News Pipeline
//!
//! A keyword-driven collection pipeline for news articles and their reader
//! comments. Collection work is requested over a durable queue, executed with
//! bounded concurrency through a pool of egress proxies, and the results are
//! delivered over further queues to a storage consumer.
//!
//! ## Usage
//!
//! ```sh
//! news_pipeline --amqp-url amqp://localhost:5672 worker
//! news_pipeline --amqp-url amqp://localhost:5672 store -o ./news_store
//! news_pipeline --amqp-url amqp://localhost:5672 submit metadata -k rust --start 2025-06-01 --end 2025-06-07
//! ```
//!
//! ## Architecture
//!
//! 1. **Intake**: the orchestrator records a request and queues it
//! 2. **Collection**: a worker plans day shards (or one historical scroll),
//!    runs them through the bounded executor and publishes result batches
//! 3. **Storage**: the store consumer upserts articles and comments
//! 4. **Status**: workers report progress back to the orchestrator

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{fmt as tfmt, EnvFilter};

mod cli;
mod collectors;
mod config;
mod errors;
mod executor;
mod fetch;
mod messaging;
mod models;
mod offload;
mod orchestrator;
mod parser;
mod pool;
mod retry;
mod scheduler;
mod storage;
#[cfg(test)]
mod testing;
mod utils;
mod worker;

use cli::{BrokerKind, Cli, Command, CollectArgs, RequestArgs};
use collectors::{CollectorDeps, CollectorRegistry, MetadataCollector, NaverNewsApi, NewsSearchApi};
use config::PipelineConfig;
use fetch::HttpFetcher;
use messaging::amqp::AmqpBroker;
use messaging::memory::MemoryBroker;
use messaging::{Broker, Publisher, Subscriber, COMMENTS_QUEUE, METADATA_QUEUE};
use models::CollectionRequest;
use offload::BlockingPool;
use orchestrator::{RequestOrchestrator, StatusListener};
use parser::SelectorParser;
use pool::ResourcePool;
use retry::RetryPolicy;
use storage::{CommentsStoreHandler, JsonFileSink, MetadataStoreHandler};
use worker::CollectionWorker;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_pipeline starting up");

    let args = Cli::parse();
    debug!(?args.broker, ?args.config, "Parsed CLI arguments");

    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.amqp_url {
        config.broker.url = url.clone();
    }
    if let Some(id) = &args.api_client_id {
        config.api.client_id = Some(id.clone());
    }
    if let Some(secret) = &args.api_client_secret {
        config.api.client_secret = Some(secret.clone());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; shutting down");
                shutdown.cancel();
            }
        });
    }

    let broker: Arc<dyn Broker> = match args.broker {
        BrokerKind::Memory => Arc::new(MemoryBroker::new(config.broker.dead_letter)),
        BrokerKind::Amqp => Arc::new(AmqpBroker::from_config(&config.broker)),
    };

    match args.command {
        Command::Collect(collect) => run_collect(&config, broker, collect, &shutdown).await?,
        Command::Worker => run_worker(&config, broker, &shutdown).await?,
        Command::Store { output_dir } => {
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            run_store(&config, broker, &shutdown).await?
        }
        Command::Submit(submit) => {
            let record = run_submit(
                &config,
                broker,
                &submit.request,
                Duration::from_secs(submit.timeout_secs),
                &shutdown,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::RunLocal { output_dir, request } => {
            if let Some(dir) = output_dir {
                config.storage.output_dir = dir;
            }
            let memory = MemoryBroker::new(config.broker.dead_letter);
            let record = run_local(&config, memory, &request, &shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    shutdown.cancel();
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );
    Ok(())
}

/// Build the fetch side: proxy pool (with its health checker), offload
/// slots, fetcher, parser and the news-search API client.
fn collector_deps(config: &PipelineConfig, shutdown: &CancellationToken) -> errors::Result<CollectorDeps> {
    let pool = if config.pool.endpoints.is_empty() {
        info!("No proxy endpoints configured; fetching directly");
        None
    } else {
        let pool = Arc::new(ResourcePool::from_config(&config.pool));
        Arc::clone(&pool).spawn_health_checker(shutdown.clone());
        info!(endpoints = config.pool.endpoints.len(), "Proxy pool ready");
        Some(pool)
    };
    let news_api = NaverNewsApi::from_config(&config.api)?.map(|api| Arc::new(api) as Arc<dyn NewsSearchApi>);
    if news_api.is_none() {
        info!("No news API credentials; API collection disabled");
    }
    Ok(CollectorDeps {
        pool,
        offload: Arc::new(BlockingPool::new(config.fetch.offload_threads)),
        fetcher: Arc::new(HttpFetcher::new(config.fetch.clone())),
        parser: Arc::new(SelectorParser::new(&config.parser)?),
        news_api,
    })
}

async fn run_collect(
    config: &PipelineConfig,
    broker: Arc<dyn Broker>,
    args: CollectArgs,
    shutdown: &CancellationToken,
) -> errors::Result<()> {
    let deps = collector_deps(config, shutdown)?;
    let collector = MetadataCollector::standard(config, &deps);
    let params = serde_json::from_value(args.search.to_params())?;
    let payload = collector.collect_payload(&params, shutdown).await?;
    deps.offload.close();

    if args.publish {
        let publisher = Publisher::new(broker, config.broker.clone());
        publisher.publish_json(METADATA_QUEUE, &payload).await?;
        publisher.close().await;
        info!(articles = payload.articles.len(), "Published metadata batch");
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn worker_handler(
    config: &PipelineConfig,
    publisher: Arc<Publisher>,
    shutdown: &CancellationToken,
) -> errors::Result<Arc<CollectionWorker>> {
    let deps = collector_deps(config, shutdown)?;
    let registry = CollectorRegistry::standard(config, deps);
    let status_retry = RetryPolicy::new(
        config.subscriber.handler_attempts,
        Duration::from_millis(config.subscriber.handler_retry_delay_ms),
    );
    Ok(Arc::new(
        CollectionWorker::new(Arc::new(registry), publisher).with_status_retry(status_retry),
    ))
}

async fn run_worker(
    config: &PipelineConfig,
    broker: Arc<dyn Broker>,
    shutdown: &CancellationToken,
) -> errors::Result<()> {
    let publisher = Arc::new(Publisher::new(Arc::clone(&broker), config.broker.clone()));
    let worker = worker_handler(config, Arc::clone(&publisher), shutdown)?;
    let subscriber = Subscriber::new(broker, config.broker.clone(), config.subscriber.clone())
        .with_handler(worker);
    info!("Worker consuming collection requests");
    let result = subscriber.run(shutdown.clone()).await;
    publisher.close().await;
    result
}

async fn run_store(
    config: &PipelineConfig,
    broker: Arc<dyn Broker>,
    shutdown: &CancellationToken,
) -> errors::Result<()> {
    let sink = Arc::new(JsonFileSink::open(&config.storage.output_dir).await?);
    let subscriber = Subscriber::new(broker, config.broker.clone(), config.subscriber.clone())
        .with_handler(Arc::new(MetadataStoreHandler::new(sink.clone())))
        .with_handler(Arc::new(CommentsStoreHandler::new(sink)));
    info!(path = %config.storage.output_dir, "Store consuming result queues");
    subscriber.run(shutdown.clone()).await
}

/// Submit `request`, consume status updates until it is terminal and
/// return the final record.
async fn run_submit(
    config: &PipelineConfig,
    broker: Arc<dyn Broker>,
    request: &RequestArgs,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> errors::Result<CollectionRequest> {
    let publisher = Arc::new(Publisher::new(Arc::clone(&broker), config.broker.clone()));
    let orchestrator = Arc::new(RequestOrchestrator::new(Arc::clone(&publisher), &config.orchestrator));
    let listener_stop = shutdown.child_token();
    let listener = {
        let subscriber = Subscriber::new(broker, config.broker.clone(), config.subscriber.clone())
            .with_handler(Arc::new(StatusListener::new(Arc::clone(&orchestrator))));
        let stop = listener_stop.clone();
        tokio::spawn(async move { subscriber.run(stop).await })
    };

    let (kind, params) = request.to_request();
    let request_id = orchestrator.submit(kind, params).await?;
    info!(%request_id, %kind, "Submitted; waiting for completion");

    let outcome = tokio::time::timeout(timeout, orchestrator.wait_terminal(&request_id, shutdown)).await;
    listener_stop.cancel();
    if let Ok(Err(e)) = listener.await {
        error!(error = %e, "Status listener stopped with an error");
    }
    publisher.close().await;

    match outcome {
        Ok(record) => record,
        Err(_) => {
            warn!(%request_id, ?timeout, "Timed out waiting for request");
            orchestrator
                .get_status(&request_id)
                .ok_or_else(|| errors::PipelineError::InvalidRequest(format!("unknown request {request_id}")))
        }
    }
}

/// All roles in one process: worker, store and status listener consume one
/// in-memory broker while the request is submitted and followed.
async fn run_local(
    config: &PipelineConfig,
    memory: MemoryBroker,
    request: &RequestArgs,
    shutdown: &CancellationToken,
) -> errors::Result<CollectionRequest> {
    let broker: Arc<dyn Broker> = Arc::new(memory.clone());
    let stop = shutdown.child_token();
    let publisher = Arc::new(Publisher::new(Arc::clone(&broker), config.broker.clone()));
    let orchestrator = Arc::new(RequestOrchestrator::new(Arc::clone(&publisher), &config.orchestrator));
    Arc::clone(&orchestrator).spawn_sweeper(stop.clone());

    let sink = Arc::new(JsonFileSink::open(&config.storage.output_dir).await?);
    let subscriber = Subscriber::new(Arc::clone(&broker), config.broker.clone(), config.subscriber.clone())
        .with_handler(worker_handler(config, Arc::clone(&publisher), &stop)?)
        .with_handler(Arc::new(MetadataStoreHandler::new(sink.clone())))
        .with_handler(Arc::new(CommentsStoreHandler::new(sink.clone())))
        .with_handler(Arc::new(StatusListener::new(Arc::clone(&orchestrator))));
    let consumers = {
        let stop = stop.clone();
        tokio::spawn(async move { subscriber.run(stop).await })
    };

    let (kind, params) = request.to_request();
    let request_id = orchestrator.submit(kind, params).await?;
    let record = orchestrator.wait_terminal(&request_id, shutdown).await;

    // Results are queued before the terminal status; wait for the store to
    // pick them up. In-flight deliveries finish after `stop`.
    while !shutdown.is_cancelled()
        && (memory.depth(METADATA_QUEUE) > 0 || memory.depth(COMMENTS_QUEUE) > 0)
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stop.cancel();
    match consumers.await {
        Ok(Err(e)) => error!(error = %e, "Consumers stopped with an error"),
        Err(e) => error!(error = %e, "Consumer task panicked"),
        Ok(Ok(())) => {}
    }
    publisher.close().await;

    let articles = sink.articles().await.map(|a| a.len()).unwrap_or(0);
    info!(%request_id, articles, path = %config.storage.output_dir, "Local run finished");
    record
}
