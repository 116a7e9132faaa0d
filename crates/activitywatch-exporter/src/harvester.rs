// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent retrieval of every bucket's events.
//!
//! One task per bucket fetches and renders its events. Rendered records are
//! appended to a shared [`Payload`] and failed fetches bump a shared counter;
//! both are read once every task has finished.

use chrono::Local;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::activitywatch::{window_start, ActivityWatchClient, Bucket};
use crate::line_protocol::transcode_bucket;
use crate::ExportError;

/// Append-only buffer of rendered records shared by the bucket tasks.
#[derive(Debug, Default)]
pub struct Payload {
    buf: Mutex<Vec<u8>>,
}

impl Payload {
    pub fn append(&self, lines: &[u8]) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(lines);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a harvest, consumed by the shipper.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Harvest {
    /// Newline-terminated line protocol records.
    pub payload: Vec<u8>,
    /// Buckets whose events couldn't be retrieved.
    pub failures: u64,
    pub records: usize,
    pub sources: usize,
}

pub struct Harvester {
    client: Arc<ActivityWatchClient>,
}

impl Harvester {
    pub fn new(client: Arc<ActivityWatchClient>) -> Self {
        Self { client }
    }

    /// Retrieves and renders the events of the last `days` days from every bucket.
    ///
    /// Failing to list the buckets is fatal. A bucket whose events can't be
    /// retrieved is logged and counted in [`Harvest::failures`].
    pub async fn harvest(&self, days: u32) -> Result<Harvest, ExportError> {
        let buckets = self
            .client
            .buckets()
            .await
            .map_err(ExportError::BucketList)?;
        let start: Arc<str> = window_start(Local::now(), days)
            .ok_or(ExportError::InvalidWindow(days))?
            .into();
        info!("Fetching events of {} buckets since {start}", buckets.len());

        let sources = buckets.len();
        let payload = Arc::new(Payload::default());
        let failures = Arc::new(AtomicU64::new(0));
        let records = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for bucket in buckets.into_values() {
            let client = Arc::clone(&self.client);
            let start = Arc::clone(&start);
            let payload = Arc::clone(&payload);
            let failures = Arc::clone(&failures);
            let records = Arc::clone(&records);
            set.spawn(async move {
                harvest_bucket(&client, &bucket, &start, &payload, &failures, &records).await;
            });
        }

        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                error!("Bucket task did not complete: {e}");
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let payload = match Arc::try_unwrap(payload) {
            Ok(payload) => payload.into_inner(),
            Err(shared) => shared.buf.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        };

        Ok(Harvest {
            payload,
            failures: failures.load(Ordering::Relaxed),
            records: records.load(Ordering::Relaxed),
            sources,
        })
    }
}

async fn harvest_bucket(
    client: &ActivityWatchClient,
    bucket: &Bucket,
    start: &str,
    payload: &Payload,
    failures: &AtomicU64,
    records: &AtomicUsize,
) {
    let events = match client.events(&bucket.id, start).await {
        Ok(events) => events,
        Err(e) => {
            failures.fetch_add(1, Ordering::Relaxed);
            error!("Error trying to get events for bucket={}: {e}", bucket.id);
            return;
        }
    };
    debug!("Fetched {} events for bucket={}", events.len(), bucket.id);

    let output = transcode_bucket(bucket, &events);
    if !output.is_empty() {
        payload.append(output.lines.as_bytes());
        records.fetch_add(output.records, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_appends_in_order() {
        assert!(Payload::default().into_inner().is_empty());

        let payload = Payload::default();
        payload.append(b"a 1\n");
        payload.append(b"b 2\n");

        assert_eq!(payload.into_inner(), b"a 1\nb 2\n".to_vec());
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let payload = Arc::new(Payload::default());
        let lines: Vec<String> = (0..16)
            .map(|i| format!("m,t={i} f={i}\n").repeat(100))
            .collect();

        std::thread::scope(|scope| {
            for chunk in &lines {
                let payload = Arc::clone(&payload);
                scope.spawn(move || payload.append(chunk.as_bytes()));
            }
        });

        let payload = String::from_utf8(Arc::try_unwrap(payload).unwrap().into_inner()).unwrap();
        for chunk in &lines {
            assert!(payload.contains(chunk.as_str()));
        }
        assert_eq!(payload.len(), lines.iter().map(String::len).sum::<usize>());
    }
}
