use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use tracing::debug;

use crate::target::LabelSet;

/// One uploadable series: the scope's public labels plus the raw, gzipped
/// pprof payloads collected for it. One series per cycle.
#[derive(Debug, Clone)]
pub struct RawProfileSeries {
    pub labels: LabelSet,
    pub samples: Vec<Vec<u8>>,
}

/// Where finished profiles go. Writes are awaited by the profiling cycle so
/// a stalled store back-pressures profile generation instead of queueing
/// payloads in memory.
pub trait ProfileStore: Send + Sync {
    fn write_raw(&self, series: &[RawProfileSeries]) -> Result<()>;
}

/// The debug info half of the store: existence probes and uploads keyed by
/// build id.
pub trait DebugInfoStore: Send + Sync {
    fn exists(&self, build_id: &str) -> Result<bool>;
    fn upload(&self, build_id: &str, debug_info: Vec<u8>) -> Result<()>;
}

/// Stands in when no store address is configured. Profiles are dropped and
/// every build id is reported as already known so nothing gets extracted.
pub struct NullStore;

impl ProfileStore for NullStore {
    fn write_raw(&self, _series: &[RawProfileSeries]) -> Result<()> {
        Ok(())
    }
}

impl DebugInfoStore for NullStore {
    fn exists(&self, _build_id: &str) -> Result<bool> {
        Ok(true)
    }

    fn upload(&self, _build_id: &str, _debug_info: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// Blocking HTTP client for a remote profile store, carrying the series
/// labels as query parameters and the payload in the body.
pub struct HttpStore {
    server_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpStore {
    pub fn new(server_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn authorized(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ProfileStore for HttpStore {
    fn write_raw(&self, series: &[RawProfileSeries]) -> Result<()> {
        for entry in series {
            for sample in &entry.samples {
                let request = self
                    .client
                    .post(format!("{}/profiles/write", self.server_url))
                    .query(&entry.labels)
                    .body(sample.clone());
                let response = self.authorized(request).send()?;
                if !response.status().is_success() {
                    return Err(anyhow!(
                        "profile store rejected write with {}",
                        response.status()
                    ));
                }
            }
        }
        Ok(())
    }
}

impl DebugInfoStore for HttpStore {
    fn exists(&self, build_id: &str) -> Result<bool> {
        let request = self
            .client
            .get(format!("{}/debuginfo/{}", self.server_url, build_id));
        let response = self.authorized(request).send()?;
        debug!("debug info probe for {}: {}", build_id, response.status());
        Ok(response.status() == StatusCode::OK)
    }

    fn upload(&self, build_id: &str, debug_info: Vec<u8>) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/debuginfo/{}", self.server_url, build_id))
            .body(debug_info);
        let response = self.authorized(request).send()?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "debug info store rejected {} with {}",
                build_id,
                response.status()
            ));
        }
        Ok(())
    }
}
