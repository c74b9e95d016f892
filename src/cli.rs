//! Command-line interface definitions for the news pipeline.
//!
//! Global options select the config file and broker; each subcommand runs
//! one role of the pipeline. Connection settings may also come from the
//! environment.

use crate::models::{CollectionMethod, CollectionType};
use crate::utils::parse_request_date;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

/// Command-line arguments for the news pipeline.
///
/// # Examples
///
/// ```sh
/// # Collect one keyword locally and print the batch
/// news_pipeline collect -k "rust" --start 2025-06-01 --end 2025-06-07
///
/// # Long-running roles against RabbitMQ
/// news_pipeline --amqp-url amqp://localhost:5672 worker
/// news_pipeline --amqp-url amqp://localhost:5672 store -o ./news_store
///
/// # Everything in one process on the in-memory broker
/// news_pipeline run-local metadata -k "rust" --start 2025-06-01 --end 2025-06-07
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional path to a YAML config file
    #[arg(short, long, env = "NEWS_PIPELINE_CONFIG", global = true)]
    pub config: Option<String>,

    /// Message broker backend
    #[arg(long, value_enum, default_value_t = BrokerKind::Amqp, global = true)]
    pub broker: BrokerKind,

    /// AMQP URL, overriding `broker.url` from the config file
    #[arg(long, env = "AMQP_URL", global = true)]
    pub amqp_url: Option<String>,

    /// News-search API client id, overriding `api.client_id`
    #[arg(long, env = "NAVER_CLIENT_ID", hide_env_values = true, global = true)]
    pub api_client_id: Option<String>,

    /// News-search API client secret, overriding `api.client_secret`
    #[arg(long, env = "NAVER_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub api_client_secret: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokerKind {
    Amqp,
    Memory,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one metadata collection in this process
    Collect(CollectArgs),

    /// Consume collection requests and run them
    Worker,

    /// Consume result queues into a JSON storage directory
    Store {
        /// Storage directory, overriding `storage.output_dir`
        #[arg(short, long)]
        output_dir: Option<String>,
    },

    /// Submit a request and follow it until it finishes
    Submit(SubmitArgs),

    /// Run orchestrator, worker and store together on the in-memory broker
    RunLocal {
        /// Storage directory, overriding `storage.output_dir`
        #[arg(short, long)]
        output_dir: Option<String>,

        #[command(subcommand)]
        request: RequestArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Search keyword
    #[arg(short, long)]
    pub keyword: String,

    /// First publication day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub start: NaiveDate,

    /// Last publication day (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub end: NaiveDate,

    /// Result cap
    #[arg(long, default_value_t = 100)]
    pub max_articles: usize,

    /// Mark collected records as test data
    #[arg(long)]
    pub test: bool,

    /// Page through the news-search API instead of scraping search pages
    #[arg(long)]
    pub api: bool,
}

impl SearchArgs {
    pub fn method(&self) -> CollectionMethod {
        if self.api {
            CollectionMethod::Api
        } else {
            CollectionMethod::Search
        }
    }

    pub fn to_params(&self) -> Value {
        json!({
            "keyword": self.keyword,
            "method": self.method(),
            "start_date": self.start,
            "end_date": self.end,
            "max_articles": self.max_articles,
            "is_test": self.test,
        })
    }
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    #[command(flatten)]
    pub search: SearchArgs,

    /// Publish the batch to `metadata_queue` instead of printing it
    #[arg(long)]
    pub publish: bool,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Seconds to wait for the request to finish
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub request: RequestArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RequestArgs {
    /// Keyword search over a date range
    Metadata(SearchArgs),

    /// Comments for known article URLs
    Comments {
        /// Article URL (repeatable)
        #[arg(long = "url", required = true)]
        urls: Vec<String>,

        #[arg(long)]
        test: bool,
    },
}

impl RequestArgs {
    pub fn to_request(&self) -> (CollectionType, Value) {
        match self {
            RequestArgs::Metadata(search) => (CollectionType::Metadata, search.to_params()),
            RequestArgs::Comments { urls, test } => (
                CollectionType::Comments,
                json!({"article_urls": urls, "is_test": test}),
            ),
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    parse_request_date(s).ok_or_else(|| format!("expected YYYY-MM-DD, got {s:?}"))
}
