// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendering of ActivityWatch events as InfluxDB line protocol records.
//!
//! A bucket's type tag selects one of the known [`Measurement`]s. Each event's
//! opaque `data` is decoded into the matching [`EventData`] variant and rendered
//! as one record:
//!
//! ```text
//! measurement,tag1=v1,tag2=v2 field1=v1,field2=v2 unix_seconds
//! ```
//!
//! Events that can't be decoded are logged and dropped, their siblings are
//! still rendered.

use serde::Deserialize;
use std::fmt::{self, Display, Write};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::activitywatch::{Bucket, Event};
use crate::escape::{escape_field_string, escape_tag_value};

pub const WEB_TAB_CURRENT: &str = "web.tab.current";
pub const APP_EDITOR_ACTIVITY: &str = "app.editor.activity";
pub const CURRENT_WINDOW: &str = "currentwindow";
pub const GENERAL_STOPWATCH: &str = "general.stopwatch";
pub const AFK_STATUS: &str = "afkstatus";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    WebTabCurrent,
    AppEditorActivity,
    CurrentWindow,
    Stopwatch,
    AfkStatus,
}

impl Measurement {
    /// Maps a bucket type tag to its measurement, `None` for unsupported types.
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            WEB_TAB_CURRENT => Some(Self::WebTabCurrent),
            APP_EDITOR_ACTIVITY => Some(Self::AppEditorActivity),
            CURRENT_WINDOW => Some(Self::CurrentWindow),
            GENERAL_STOPWATCH => Some(Self::Stopwatch),
            AFK_STATUS => Some(Self::AfkStatus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::WebTabCurrent => WEB_TAB_CURRENT,
            Self::AppEditorActivity => APP_EDITOR_ACTIVITY,
            Self::CurrentWindow => CURRENT_WINDOW,
            Self::Stopwatch => GENERAL_STOPWATCH,
            Self::AfkStatus => AFK_STATUS,
        }
    }

    /// Decodes an event payload into the shape this measurement expects.
    pub fn decode(self, data: &serde_json::Value) -> Result<EventData, serde_json::Error> {
        Ok(match self {
            Self::WebTabCurrent => EventData::WebTab(WebTab::deserialize(data)?),
            Self::AppEditorActivity => EventData::EditorActivity(EditorActivity::deserialize(data)?),
            Self::CurrentWindow => EventData::WindowFocus(WindowFocus::deserialize(data)?),
            Self::Stopwatch => EventData::Stopwatch(Stopwatch::deserialize(data)?),
            Self::AfkStatus => EventData::AfkStatus(AfkStatus::deserialize(data)?),
        })
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WebTab {
    pub url: String,
    pub title: String,
    pub audible: bool,
    pub incognito: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EditorActivity {
    pub file: String,
    pub project: String,
    pub language: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowFocus {
    pub app: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AfkStatus {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Stopwatch {
    pub label: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    WebTab(WebTab),
    EditorActivity(EditorActivity),
    WindowFocus(WindowFocus),
    AfkStatus(AfkStatus),
    Stopwatch(Stopwatch),
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("error unmarshalling event data: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("error parsing URL={url}: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Rendered with three decimals.
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v:.3}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "\"{}\"", escape_field_string(v)),
        }
    }
}

/// One line protocol record. Tag values are escaped when the record is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub measurement: Measurement,
    pub tags: Vec<(&'static str, String)>,
    pub fields: Vec<(&'static str, FieldValue)>,
    /// Seconds since the epoch.
    pub timestamp: i64,
}

impl Record {
    fn new(measurement: Measurement, bucket: &Bucket, event: &Event) -> Self {
        Self {
            measurement,
            tags: vec![
                ("client", bucket.client.clone()),
                ("hostname", bucket.hostname.clone()),
            ],
            fields: vec![("duration", FieldValue::Float(event.duration))],
            timestamp: event.timestamp.timestamp(),
        }
    }

    fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.push((key, value.into()));
        self
    }

    fn field(mut self, key: &'static str, value: FieldValue) -> Self {
        self.fields.push((key, value));
        self
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.measurement.name())?;
        for (key, value) in &self.tags {
            write!(f, ",{key}={}", escape_tag_value(value))?;
        }
        for (i, (key, value)) in self.fields.iter().enumerate() {
            let separator = if i == 0 { ' ' } else { ',' };
            write!(f, "{separator}{key}={value}")?;
        }
        writeln!(f, " {}", self.timestamp)
    }
}

/// Host part of a tab URL, including an explicit port.
///
/// References without a scheme (including the empty string) have no host.
fn url_host(raw: &str) -> Result<Option<String>, url::ParseError> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(url
        .host_str()
        .filter(|host| !host.is_empty())
        .map(|host| match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }))
}

/// Renders one event of `bucket` as a record of the given measurement.
pub fn render_event(
    measurement: Measurement,
    bucket: &Bucket,
    event: &Event,
) -> Result<Record, TranscodeError> {
    let record = Record::new(measurement, bucket, event);

    Ok(match measurement.decode(&event.data)? {
        EventData::WebTab(tab) => {
            let host = url_host(&tab.url).map_err(|source| TranscodeError::Url {
                url: tab.url.clone(),
                source,
            })?;
            let record = match host {
                Some(host) => record.tag("url", host),
                None => record,
            };
            record
                .field("audible", FieldValue::Bool(tab.audible))
                .field("incognito", FieldValue::Bool(tab.incognito))
        }
        EventData::EditorActivity(activity) => record
            .tag("project", activity.project)
            .tag("language", activity.language)
            .tag("file", activity.file),
        EventData::WindowFocus(window) => record.tag("app", window.app),
        EventData::Stopwatch(stopwatch) => {
            let record = if stopwatch.label.is_empty() {
                record
            } else {
                record.tag("label", stopwatch.label)
            };
            record.field("running", FieldValue::Bool(stopwatch.running))
        }
        EventData::AfkStatus(afk) => record.field("status", FieldValue::Str(afk.status)),
    })
}

/// Records rendered for one bucket.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TranscodeOutput {
    pub lines: String,
    pub records: usize,
    pub skipped: usize,
}

impl TranscodeOutput {
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

/// Renders every event of `bucket`, skipping the ones that fail.
///
/// A bucket whose type is unknown yields no records; that is a skip, not a failure.
pub fn transcode_bucket(bucket: &Bucket, events: &[Event]) -> TranscodeOutput {
    let mut output = TranscodeOutput::default();

    let Some(measurement) = Measurement::from_type_tag(&bucket.kind) else {
        info!(
            "Skipping unknown event type: {} (bucket={}, {} events)",
            bucket.kind,
            bucket.id,
            events.len()
        );
        output.skipped = events.len();
        return output;
    };

    for event in events {
        match render_event(measurement, bucket, event) {
            Ok(record) => {
                // Writing into a String can't fail.
                let _ = write!(output.lines, "{record}");
                output.records += 1;
            }
            Err(e @ TranscodeError::Decode(_)) => {
                warn!(
                    "Error unmarshalling event data for bucket={} data={}: {e}",
                    bucket.id, event.data
                );
                output.skipped += 1;
            }
            Err(e) => {
                warn!("Skipping event for bucket={}: {e}", bucket.id);
                output.skipped += 1;
            }
        }
    }

    debug!(
        "Rendered {} records for bucket={} ({} skipped)",
        output.records, bucket.id, output.skipped
    );
    output
}
