pub mod cloudflare;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordType {
    A,
    #[allow(clippy::upper_case_acronyms)]
    AAAA,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::AAAA => f.write_str("AAAA"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    /// Network failure, timeout or an undecodable body
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider rejected request: {0}")]
    Api(String),
}

/// Record-management operations the updater needs from a DNS provider.
///
/// Implementations never retry; every failure comes back as a
/// [`ProviderError`] and is logged where it happens.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Zone id for an apex such as `example.com`.
    async fn resolve_zone(&self, apex: &str) -> Result<String, ProviderError>;

    /// Record id for the fully qualified `name` inside `zone_id`.
    async fn resolve_record(&self, zone_id: &str, name: &str) -> Result<String, ProviderError>;

    /// Overwrites an existing record.
    async fn upsert_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> Result<(), ProviderError>;
}
