//! Pluggable third-party OOB backends
//!
//! A broker serves `RequireDomain`/`GetResult`-style calls instead of the
//! local DNS listener. Brokers are registered per mode string; the service
//! remembers which mode issued each token so later queries route back to
//! the same backend.

use crate::{DnsLogError, DomainAssignment};
use async_trait::async_trait;
use mirrortrap_proto::DnsLogEvent;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// A third-party OOB backend
#[async_trait]
pub trait DnsLogBroker: Send + Sync {
    /// Issue a fresh correlation domain and token
    async fn require_domain(&self) -> Result<DomainAssignment, DnsLogError>;

    /// Fetch interactions observed for a previously issued token
    async fn query_results(&self, token: &str) -> Result<Vec<DnsLogEvent>, DnsLogError>;
}

#[derive(Debug, Deserialize)]
struct RemoteDomain {
    domain: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RemoteEvent {
    #[serde(rename = "type")]
    event_type: String,
    domain: String,
    remote_addr: String,
    #[serde(default)]
    timestamp: i64,
}

/// Generic HTTP JSON broker
///
/// `GET {base}/require` must answer `{"domain": ..., "token": ...}`;
/// `GET {base}/query?token=...` must answer a list of
/// `{"type", "domain", "remote_addr", "timestamp"}` objects.
pub struct RemoteHttpBroker {
    mode: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteHttpBroker {
    pub fn new(mode: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn broker_err(&self, err: impl std::fmt::Display) -> DnsLogError {
        DnsLogError::Broker(self.mode.clone(), err.to_string())
    }
}

#[async_trait]
impl DnsLogBroker for RemoteHttpBroker {
    async fn require_domain(&self) -> Result<DomainAssignment, DnsLogError> {
        let url = format!("{}/require", self.base_url);
        debug!(mode = %self.mode, url = %url, "Requesting broker domain");
        let remote: RemoteDomain = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.broker_err(e))?
            .error_for_status()
            .map_err(|e| self.broker_err(e))?
            .json()
            .await
            .map_err(|e| self.broker_err(e))?;

        Ok(DomainAssignment {
            domain: remote.domain,
            token: remote.token,
            mode: self.mode.clone(),
        })
    }

    async fn query_results(&self, token: &str) -> Result<Vec<DnsLogEvent>, DnsLogError> {
        let url = format!("{}/query", self.base_url);
        let remote: Vec<RemoteEvent> = self
            .client
            .get(&url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| self.broker_err(e))?
            .error_for_status()
            .map_err(|e| self.broker_err(e))?
            .json()
            .await
            .map_err(|e| self.broker_err(e))?;

        Ok(remote
            .into_iter()
            .map(|e| {
                let (remote_ip, remote_port) = split_host_port(&e.remote_addr);
                DnsLogEvent {
                    event_type: e.event_type,
                    token: token.to_string(),
                    domain: e.domain,
                    remote_addr: e.remote_addr,
                    remote_ip,
                    remote_port,
                    raw: Vec::new(),
                    timestamp: e.timestamp,
                }
            })
            .collect())
    }
}

/// Split "host:port", tolerating a bare host
pub(crate) fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (addr.to_string(), 0),
    }
}
