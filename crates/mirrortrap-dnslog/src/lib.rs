//! DNS-log correlation service
//!
//! Issues per-operation subdomains/tokens and correlates observed DNS
//! queries and blind HTTP/HTTPS callbacks back to them. Tokens come from
//! a configured root domain or from a pluggable third-party broker; all
//! correlation state lives in 24-hour TTL caches.

pub mod broker;
pub mod dns;
pub mod http_trigger;
pub mod listener;

pub use broker::{DnsLogBroker, RemoteHttpBroker};
pub use http_trigger::HttpTriggerServer;
pub use listener::DnsLogListener;

use mirrortrap_cache::TtlCache;
use mirrortrap_proto::DnsLogEvent;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CORRELATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const TOKEN_LEN: usize = 10;
const BROKER_REQUIRE_TIMEOUT: Duration = Duration::from_secs(15);
const BROKER_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// DNS-log errors
#[derive(Debug, Error)]
pub enum DnsLogError {
    #[error("no domain available")]
    NoDomainAvailable,

    #[error("Broker {0} failed: {1}")]
    Broker(String, String),

    #[error("Broker {0} timed out")]
    BrokerTimeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An issued correlation domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAssignment {
    pub domain: String,
    pub token: String,
    pub mode: String,
}

/// DNS-log service configuration
#[derive(Debug, Clone)]
pub struct DnsLogConfig {
    /// Root domains this server is authoritative for
    pub domains: Vec<String>,
    /// Address answered for A queries and reported for trigger ports
    pub external_ip: Ipv4Addr,
}

/// The DNS-log correlation service
pub struct DnsLogService {
    config: DnsLogConfig,
    brokers: HashMap<String, Arc<dyn DnsLogBroker>>,
    /// token -> observed DNS events
    events: TtlCache<String, Vec<DnsLogEvent>>,
    /// token -> mode that issued it
    token_modes: TtlCache<String, String>,
    /// tokens with an active HTTP/HTTPS trigger registration
    http_tokens: TtlCache<String, ()>,
    /// token -> observed HTTP/HTTPS hits
    http_events: TtlCache<String, Vec<DnsLogEvent>>,
}

impl DnsLogService {
    pub fn new(config: DnsLogConfig) -> Self {
        Self {
            config,
            brokers: HashMap::new(),
            events: TtlCache::new(CORRELATION_TTL),
            token_modes: TtlCache::new(CORRELATION_TTL),
            http_tokens: TtlCache::new(CORRELATION_TTL),
            http_events: TtlCache::new(CORRELATION_TTL),
        }
    }

    /// Register a broker backend for `mode`
    pub fn with_broker(mut self, mode: impl Into<String>, broker: Arc<dyn DnsLogBroker>) -> Self {
        self.brokers.insert(mode.into(), broker);
        self
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.config.external_ip
    }

    /// Issue a correlation domain, through the broker named by `mode` when
    /// one is registered, otherwise from a configured root domain.
    pub async fn require_domain(&self, mode: &str) -> Result<DomainAssignment, DnsLogError> {
        if let Some(broker) = self.brokers.get(mode) {
            let assignment = tokio::time::timeout(BROKER_REQUIRE_TIMEOUT, broker.require_domain())
                .await
                .map_err(|_| DnsLogError::BrokerTimeout(mode.to_string()))??;

            self.token_modes
                .set(assignment.token.clone(), mode.to_string());
            // Broker domains also catch blind HTTP callbacks against us
            self.http_tokens.set(assignment.token.clone(), ());
            info!(mode = %mode, domain = %assignment.domain, "Issued broker domain");
            return Ok(assignment);
        }

        if self.config.domains.is_empty() {
            return Err(DnsLogError::NoDomainAvailable);
        }

        let token = random_token();
        let root = {
            let mut rng = rand::thread_rng();
            &self.config.domains[rng.gen_range(0..self.config.domains.len())]
        };
        let domain = format!("{}.{}", token, root);
        self.token_modes.set(token.clone(), String::new());
        info!(domain = %domain, "Issued local domain");

        Ok(DomainAssignment {
            domain,
            token,
            mode: String::new(),
        })
    }

    /// Events observed for `token`
    ///
    /// With an explicit or remembered broker mode, results come from the
    /// broker merged with locally observed HTTP hits; otherwise from the
    /// local DNS listener's cache.
    pub async fn query_existed_dnslog(
        &self,
        token: &str,
        mode: &str,
    ) -> Result<Vec<DnsLogEvent>, DnsLogError> {
        let effective_mode = if mode.is_empty() {
            self.token_modes.get(&token.to_string()).unwrap_or_default()
        } else {
            mode.to_string()
        };

        if let Some(broker) = self.brokers.get(&effective_mode) {
            let mut events =
                tokio::time::timeout(BROKER_QUERY_TIMEOUT, broker.query_results(token))
                    .await
                    .map_err(|_| DnsLogError::BrokerTimeout(effective_mode.clone()))??;

            // Each HTTP hit is surfaced twice so consumers filtering on DNS
            // record types still see the interaction
            for hit in self
                .http_events
                .get(&token.to_string())
                .unwrap_or_default()
            {
                let mut synthetic = hit.clone();
                synthetic.event_type = "A".to_string();
                events.push(hit);
                events.push(synthetic);
            }
            return Ok(events);
        }

        Ok(self.events.get(&token.to_string()).unwrap_or_default())
    }

    /// Extract the token from a query name matching one of our roots
    ///
    /// Issued domains are `<token>.<root>`; the label adjacent to the root
    /// is the token, so resolver-added prefixes still correlate.
    pub fn match_token(&self, name: &str) -> Option<String> {
        let name = name.trim_end_matches('.').to_lowercase();
        for root in &self.config.domains {
            let root = root.trim_end_matches('.').to_lowercase();
            let prefix = match name.strip_suffix(&root).and_then(|p| p.strip_suffix('.')) {
                Some(prefix) if !prefix.is_empty() => prefix,
                _ => continue,
            };
            let token = prefix.rsplit('.').next().unwrap_or(prefix);
            return Some(token.to_string());
        }
        None
    }

    /// Append a DNS event observed by the listener
    pub fn record_query(&self, token: &str, event: DnsLogEvent) {
        debug!(token = %token, event_type = %event.event_type, "Recorded DNS log event");
        let mut list = self.events.get(&token.to_string()).unwrap_or_default();
        list.push(event);
        self.events.set(token.to_string(), list);
    }

    /// Find the registered HTTP-trigger token matched by a request
    pub fn find_http_token(&self, host: &str, path: &str) -> Option<String> {
        self.http_tokens
            .entries()
            .into_iter()
            .map(|(token, _)| token)
            .find(|token| host.contains(token.as_str()) || path.contains(token.as_str()))
    }

    /// Append an HTTP/HTTPS hit observed by the trigger listener
    pub fn record_http_hit(&self, token: &str, event: DnsLogEvent) {
        debug!(token = %token, event_type = %event.event_type, "Recorded HTTP trigger event");
        let mut list = self.http_events.get(&token.to_string()).unwrap_or_default();
        list.push(event);
        self.http_events.set(token.to_string(), list);
    }
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect()
}
