// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compression and upload of the harvested payload to the InfluxDB v2 write API.

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Method, Request, StatusCode, Url};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::harvester::Harvest;
use crate::transport::HttpTransport;
use crate::ExportError;

const WRITE_API_PATH: &str = "/api/v2/write";
/// Timestamps are written in whole seconds.
const PRECISION: &str = "s";

/// Where the payload is written.
#[derive(Debug, Clone, PartialEq)]
pub struct InfluxDestination {
    /// Host, optionally with a port. An explicit `http://` or `https://` prefix
    /// is honored, otherwise `https` is used.
    pub host: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

impl InfluxDestination {
    fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }

    /// `{base}/api/v2/write?precision=s&org={org}&bucket={bucket}`
    pub fn write_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&format!("{}{WRITE_API_PATH}", self.base_url()))?;
        url.query_pairs_mut()
            .append_pair("precision", PRECISION)
            .append_pair("org", &self.org)
            .append_pair("bucket", &self.bucket);
        Ok(url)
    }
}

/// Summary of a successful upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShipReport {
    pub records: usize,
    pub sources: usize,
    pub uncompressed_bytes: usize,
    pub compressed_bytes: usize,
}

/// Gzip-compresses the payload as a single member.
pub fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

pub struct Shipper {
    transport: Arc<dyn HttpTransport>,
    destination: InfluxDestination,
}

impl Shipper {
    pub fn new(transport: Arc<dyn HttpTransport>, destination: InfluxDestination) -> Self {
        Self {
            transport,
            destination,
        }
    }

    fn create_request(&self, body: Vec<u8>) -> Result<Request, ExportError> {
        let url = self
            .destination
            .write_url()
            .map_err(ExportError::DestinationUrl)?;
        let mut authorization = HeaderValue::from_str(&format!("Token {}", self.destination.token))
            .map_err(|_| ExportError::InvalidToken)?;
        authorization.set_sensitive(true);

        let mut request = Request::new(Method::POST, url);
        let headers = request.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        *request.body_mut() = Some(body.into());
        Ok(request)
    }

    /// Uploads the harvested records in one request.
    ///
    /// Only `204 No Content` counts as delivered. A rejected upload is reported
    /// before bucket failures; bucket failures are still reported after a
    /// successful upload.
    pub async fn ship(&self, harvest: Harvest) -> Result<ShipReport, ExportError> {
        if harvest.payload.is_empty() {
            return Err(ExportError::NoData);
        }

        let compressed = compress(&harvest.payload).map_err(ExportError::Compression)?;
        let report = ShipReport {
            records: harvest.records,
            sources: harvest.sources,
            uncompressed_bytes: harvest.payload.len(),
            compressed_bytes: compressed.len(),
        };
        debug!(
            "Shipping {} records ({} bytes, {} compressed)",
            report.records, report.uncompressed_bytes, report.compressed_bytes
        );

        let request = self.create_request(compressed)?;
        let response = self
            .transport
            .send(request)
            .await
            .map_err(ExportError::Ship)?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            error!("{status}: Failed to write to InfluxDB: {body:?}");
            return Err(ExportError::Rejected { status, body });
        }
        info!(
            "Wrote {} records from {} buckets",
            report.records, report.sources
        );

        if harvest.failures > 0 {
            return Err(ExportError::SourceFailures(harvest.failures));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Mutex;

    struct CapturedRequest {
        url: String,
        headers: reqwest::header::HeaderMap,
        body: Vec<u8>,
    }

    /// Answers every request with `status` and keeps the requests it received.
    struct RecordingTransport {
        status: u16,
        requests: Mutex<Vec<CapturedRequest>>,
    }

    impl RecordingTransport {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                status,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: Request) -> Result<reqwest::Response, TransportError> {
            self.requests.lock().unwrap().push(CapturedRequest {
                url: request.url().to_string(),
                headers: request.headers().clone(),
                body: request
                    .body()
                    .and_then(|b| b.as_bytes())
                    .unwrap_or_default()
                    .to_vec(),
            });
            let response = http::Response::builder()
                .status(self.status)
                .body("{\"code\":\"invalid\",\"message\":\"unable to parse\"}")
                .unwrap();
            Ok(reqwest::Response::from(response))
        }
    }

    fn destination() -> InfluxDestination {
        InfluxDestination {
            host: "influx.example.com".to_string(),
            org: "home".to_string(),
            bucket: "activitywatch".to_string(),
            token: "secret-token".to_string(),
        }
    }

    fn harvest(payload: &str, failures: u64) -> Harvest {
        Harvest {
            payload: payload.as_bytes().to_vec(),
            failures,
            records: payload.lines().count(),
            sources: 1,
        }
    }

    const LINE: &str =
        "currentwindow,client=aw-watcher-window,hostname=desktop,app=firefox duration=25.523 1741974028\n";

    #[test]
    fn test_write_url() {
        assert_eq!(
            destination().write_url().unwrap().as_str(),
            "https://influx.example.com/api/v2/write?precision=s&org=home&bucket=activitywatch"
        );
    }

    #[test]
    fn test_write_url_honors_scheme_and_encodes_names() {
        let destination = InfluxDestination {
            host: "http://127.0.0.1:8086/".to_string(),
            org: "my org".to_string(),
            bucket: "aw&more".to_string(),
            ..destination()
        };
        assert_eq!(
            destination.write_url().unwrap().as_str(),
            "http://127.0.0.1:8086/api/v2/write?precision=s&org=my+org&bucket=aw%26more"
        );
    }

    #[test]
    fn test_compress_is_gzip() {
        let compressed = compress(LINE.as_bytes()).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, LINE);
    }

    #[tokio::test]
    async fn test_ship_sends_compressed_payload() {
        let transport = RecordingTransport::new(204);
        let shipper = Shipper::new(transport.clone(), destination());

        let report = shipper.ship(harvest(LINE, 0)).await.unwrap();

        assert_eq!(report.records, 1);
        assert_eq!(report.uncompressed_bytes, LINE.len());

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(
            request.url,
            "https://influx.example.com/api/v2/write?precision=s&org=home&bucket=activitywatch"
        );
        assert_eq!(request.headers[AUTHORIZATION], "Token secret-token");
        assert_eq!(request.headers[CONTENT_ENCODING], "gzip");
        assert_eq!(request.headers[CONTENT_TYPE], "text/plain; charset=utf-8");

        let mut decoded = String::new();
        GzDecoder::new(request.body.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, LINE);
    }

    #[tokio::test]
    async fn test_empty_payload_is_fatal() {
        let transport = RecordingTransport::new(204);
        let shipper = Shipper::new(transport.clone(), destination());

        let result = shipper.ship(harvest("", 3)).await;

        assert!(matches!(result, Err(ExportError::NoData)));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_no_content_is_success() {
        for status in [200, 201, 400, 401, 413] {
            let shipper = Shipper::new(RecordingTransport::new(status), destination());

            match shipper.ship(harvest(LINE, 0)).await {
                Err(ExportError::Rejected { status: got, body }) => {
                    assert_eq!(got.as_u16(), status);
                    assert!(body.contains("unable to parse"));
                }
                other => panic!("expected rejection for {status}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_source_failures_reported_after_upload() {
        let transport = RecordingTransport::new(204);
        let shipper = Shipper::new(transport.clone(), destination());

        let result = shipper.ship(harvest(LINE, 2)).await;

        assert!(matches!(result, Err(ExportError::SourceFailures(2))));
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_wins_over_source_failures() {
        let shipper = Shipper::new(RecordingTransport::new(400), destination());

        let result = shipper.ship(harvest(LINE, 2)).await;

        assert!(matches!(result, Err(ExportError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_invalid_token_is_rejected_before_sending() {
        let transport = RecordingTransport::new(204);
        let shipper = Shipper::new(
            transport.clone(),
            InfluxDestination {
                token: "bad\ntoken".to_string(),
                ..destination()
            },
        );

        let result = shipper.ship(harvest(LINE, 0)).await;

        assert!(matches!(result, Err(ExportError::InvalidToken)));
        assert!(transport.requests.lock().unwrap().is_empty());
    }
}
