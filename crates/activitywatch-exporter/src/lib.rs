// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exports ActivityWatch events to InfluxDB.
//!
//! A run lists every bucket of an ActivityWatch server, fetches the events of
//! the requested window from all buckets concurrently, renders them as line
//! protocol and writes them to InfluxDB in one gzip-compressed request.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub mod activitywatch;
pub mod config;
pub mod escape;
pub mod harvester;
pub mod line_protocol;
pub mod shipper;
pub mod transport;

use activitywatch::{ActivityWatchClient, FetchError};
use config::Config;
use harvester::Harvester;
use shipper::{ShipReport, Shipper};
use transport::{build_client, HttpTransport, RetryPolicy, RetryingTransport, TransportError};

/// Conditions that end a run unsuccessfully.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("error building HTTP client: {0}")]
    HttpClient(reqwest::Error),
    #[error("error trying to get bucket list: {0}")]
    BucketList(FetchError),
    #[error("invalid lookback window of {0} days")]
    InvalidWindow(u32),
    #[error("no data to send")]
    NoData,
    #[error("error compressing data: {0}")]
    Compression(std::io::Error),
    #[error("invalid InfluxDB url: {0}")]
    DestinationUrl(url::ParseError),
    #[error("InfluxDB API token is not a valid header value")]
    InvalidToken,
    #[error("error sending data: {0}")]
    Ship(TransportError),
    #[error("error sending data: {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    /// The upload went through but some buckets couldn't be read.
    #[error("errors: {0}")]
    SourceFailures(u64),
}

/// Runs one export with the default retry policy.
pub async fn run(config: &Config, days: u32) -> Result<ShipReport, ExportError> {
    run_with_policy(config, days, RetryPolicy::default()).await
}

/// Harvests the last `days` days of events and ships them.
///
/// Harvesting and shipping share one retrying client.
pub async fn run_with_policy(
    config: &Config,
    days: u32,
    policy: RetryPolicy,
) -> Result<ShipReport, ExportError> {
    let client = build_client(transport::REQUEST_TIMEOUT).map_err(ExportError::HttpClient)?;
    let transport: Arc<dyn HttpTransport> = Arc::new(RetryingTransport::new(client, policy));

    let harvester = Harvester::new(Arc::new(ActivityWatchClient::new(
        config.activitywatch_url.clone(),
        Arc::clone(&transport),
    )));
    let harvest = harvester.harvest(days).await?;
    debug!(
        "Harvested {} records from {} buckets, {} failed",
        harvest.records, harvest.sources, harvest.failures
    );

    Shipper::new(transport, config.destination())
        .ship(harvest)
        .await
}
