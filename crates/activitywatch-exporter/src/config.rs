// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exporter configuration.
//!
//! Values are read from a JSON file (`activitywatch_exporter.json` by default)
//! and can be overridden with `AW_EXPORTER_`-prefixed environment variables:
//!
//! | File key           | Environment variable             |
//! |--------------------|----------------------------------|
//! | `ActivityWatchUrl` | `AW_EXPORTER_ACTIVITYWATCH_URL`  |
//! | `InfluxDBHost`     | `AW_EXPORTER_INFLUXDB_HOST`      |
//! | `InfluxDBApiToken` | `AW_EXPORTER_INFLUXDB_API_TOKEN` |
//! | `Org`              | `AW_EXPORTER_ORG`                |
//! | `Bucket`           | `AW_EXPORTER_BUCKET`             |
//!
//! Every field is required.

use figment::providers::{Env, Format, Json};
use figment::Figment;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::shipper::InfluxDestination;

pub const DEFAULT_CONFIG_PATH: &str = "activitywatch_exporter.json";
pub const ENV_PREFIX: &str = "AW_EXPORTER_";

#[derive(Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error("error reading configuration: {0}")]
    Parse(String),
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Replaces `$target.$field` when `$source.$field` is set.
macro_rules! merge_option {
    ($target:expr, $source:expr, $($field:ident),+) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field;
            }
        )+
    };
}

/// Fields as spelled in the JSON file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(rename = "ActivityWatchUrl")]
    activitywatch_url: Option<String>,
    #[serde(rename = "InfluxDBHost")]
    influxdb_host: Option<String>,
    #[serde(rename = "InfluxDBApiToken")]
    influxdb_api_token: Option<String>,
    #[serde(rename = "Org")]
    org: Option<String>,
    #[serde(rename = "Bucket")]
    bucket: Option<String>,
}

/// Fields as spelled in the environment, lowercased with the prefix stripped.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvConfig {
    activitywatch_url: Option<String>,
    influxdb_host: Option<String>,
    influxdb_api_token: Option<String>,
    org: Option<String>,
    bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub activitywatch_url: String,
    pub influxdb_host: String,
    pub influxdb_api_token: String,
    pub org: String,
    pub bucket: String,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(field)),
    }
}

impl Config {
    /// Loads the configuration from `path`, then the environment.
    ///
    /// A missing file is not an error by itself, the environment may provide
    /// every field.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut file: FileConfig = Figment::new()
            .merge(Json::file(path))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let env: EnvConfig = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        merge_option!(
            file,
            env,
            activitywatch_url,
            influxdb_host,
            influxdb_api_token,
            org,
            bucket
        );

        let activitywatch_url = required(file.activitywatch_url, "ActivityWatchUrl")?
            .trim_end_matches('/')
            .to_string();

        Ok(Config {
            activitywatch_url,
            bucket: required(file.bucket, "Bucket")?,
            influxdb_host: required(file.influxdb_host, "InfluxDBHost")?,
            influxdb_api_token: required(file.influxdb_api_token, "InfluxDBApiToken")?,
            org: required(file.org, "Org")?,
        })
    }

    pub fn destination(&self) -> InfluxDestination {
        InfluxDestination {
            host: self.influxdb_host.clone(),
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            token: self.influxdb_api_token.clone(),
        }
    }
}
