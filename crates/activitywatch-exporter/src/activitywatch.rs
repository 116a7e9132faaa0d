// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client and data model for the ActivityWatch REST API.

use chrono::{DateTime, Days, FixedOffset, TimeZone};
use reqwest::{Method, Request, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::transport::{HttpTransport, TransportError};

const API_PREFIX: [&str; 2] = ["api", "0"];
const BUCKETS_SEGMENT: &str = "buckets";
const EVENTS_SEGMENT: &str = "events";

/// Format of the `start` query parameter: microseconds and an explicit offset.
pub const WINDOW_START_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// A bucket as listed by `GET /api/0/buckets`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Bucket {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Event type stored in the bucket, selects how its events are rendered.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub created: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub type Buckets = BTreeMap<String, Bucket>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: Option<i64>,
    pub timestamp: DateTime<FixedOffset>,
    /// Seconds.
    pub duration: f64,
    /// Shape depends on the owning bucket's type.
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("error reading response body: {0}")]
    Body(reqwest::Error),
    #[error("error unmarshalling response data {body}: {source}")]
    Decode {
        source: serde_json::Error,
        body: String,
    },
}

/// Lower bound of the requested window: `days` calendar days before `now`,
/// rendered in `now`'s offset.
///
/// Returns `None` when the subtraction leaves the supported date range.
pub fn window_start<Tz>(now: DateTime<Tz>, days: u32) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.checked_sub_days(Days::new(u64::from(days)))
        .map(|start| start.format(WINDOW_START_FORMAT).to_string())
}

pub struct ActivityWatchClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
}

impl ActivityWatchClient {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
        }
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidUrl(url::ParseError::RelativeUrlWithoutBase))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    pub fn buckets_url(&self) -> Result<Url, FetchError> {
        self.api_url(&[BUCKETS_SEGMENT])
    }

    pub fn events_url(&self, bucket_id: &str, start: &str) -> Result<Url, FetchError> {
        let mut url = self.api_url(&[BUCKETS_SEGMENT, bucket_id, EVENTS_SEGMENT])?;
        url.query_pairs_mut().append_pair("start", start);
        Ok(url)
    }

    /// Lists every bucket known to the server, keyed by bucket id.
    pub async fn buckets(&self) -> Result<Buckets, FetchError> {
        self.get_json(self.buckets_url()?).await
    }

    /// Fetches the events of one bucket recorded since `start`.
    pub async fn events(&self, bucket_id: &str, start: &str) -> Result<Vec<Event>, FetchError> {
        self.get_json(self.events_url(bucket_id, start)?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        debug!("GET {url}");
        let response = self.transport.send(Request::new(Method::GET, url)).await?;
        let status = response.status();
        let body = response.bytes().await.map_err(FetchError::Body)?;

        if status != StatusCode::OK {
            return Err(FetchError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            source,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
