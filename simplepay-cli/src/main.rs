//! SimplePay command line client
//!
//! Loads a TOML gateway configuration and runs one operation against the
//! gateway, printing the result as JSON on stdout:
//!
//! ```text
//! simplepay --config simplepay.toml query HUF 101010514 101010515
//! simplepay --config simplepay.toml status HUF 101010514
//! ```
//!
//! `query` asks the modern API about orders by merchant reference. `status`
//! runs the bounded legacy status reconciliation (IOS) for one order.

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and tracing-subscriber"
)]

mod observability;

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use simplepay::{
    Deadline, GatewayConfig, HttpTransport,
    log::TracingLogger,
    orchestrator::TransactionOrchestrator,
    poller::StatusPoller,
    request::TransactionRequest,
};

use crate::observability::{LogFormat, init_observability};

#[derive(Debug, Parser)]
#[command(name = "simplepay")]
#[command(about = "Query SimplePay orders and reconcile their status", long_about = None, version)]
struct Args {
    /// Gateway configuration file
    #[arg(short, long, default_value = "simplepay.toml")]
    config: PathBuf,

    /// Log format; falls back to the LOG_FORMAT environment variable
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Overall time limit in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Query modern transactions by merchant order reference
    Query {
        /// Currency selecting the merchant account
        currency: String,
        /// Merchant order references
        #[arg(required = true)]
        order_refs: Vec<String>,
    },
    /// Reconcile the status of a legacy order
    Status {
        /// Currency selecting the merchant account
        currency: String,
        /// Merchant order reference
        order_ref: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_observability(args.log_format.unwrap_or_else(LogFormat::from_env));

    let config = GatewayConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let transport = HttpTransport::with_config(&config.transport).context("failed to build HTTP transport")?;
    let deadline = Deadline::after(Duration::from_secs(args.timeout_secs));

    let (output, trusted) = match args.command {
        Command::Query { currency, order_refs } => query(&config, transport, deadline, &currency, order_refs).await?,
        Command::Status { currency, order_ref } => status(&config, transport, deadline, &currency, &order_ref).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    if trusted {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("gateway answer could not be verified");
        Ok(ExitCode::FAILURE)
    }
}

async fn query(
    config: &GatewayConfig,
    transport: HttpTransport,
    deadline: Deadline,
    currency: &str,
    order_refs: Vec<String>,
) -> Result<(Value, bool)> {
    let orchestrator = TransactionOrchestrator::new(config, transport, TracingLogger);
    let request = order_refs
        .into_iter()
        .fold(TransactionRequest::query().with_currency(currency), |request, order_ref| {
            request.add_merchant_order_id(order_ref)
        });

    let response = orchestrator.query(request, deadline).await.context("query failed")?;
    let output = json!({
        "signatureValid": response.signature_valid,
        "errorCodes": response.error_codes(),
        "fields": response.fields,
    });
    Ok((output, response.signature_valid))
}

async fn status(
    config: &GatewayConfig,
    transport: HttpTransport,
    deadline: Deadline,
    currency: &str,
    order_ref: &str,
) -> Result<(Value, bool)> {
    let poller = StatusPoller::new(config, transport, TracingLogger);
    let outcome = poller.poll(currency, order_ref, deadline).await.context("status reconciliation failed")?;

    let fields: Map<String, Value> =
        outcome.fields.iter().map(|(name, value)| (name.clone(), Value::String(value.clone()))).collect();
    let output = json!({
        "orderRef": order_ref,
        "status": outcome.status.as_str(),
        "successful": outcome.status.is_successful(),
        "hashValid": outcome.valid,
        "attempts": outcome.attempts,
        "fields": fields,
    });
    Ok((output, outcome.valid))
}
