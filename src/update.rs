//! Batch update orchestration.
//!
//! A request is validated and authorized as a whole, then each domain is
//! pushed through zone lookup, record lookup and record update on its own.
//! Authorization is all-or-nothing while the per-domain loop tolerates
//! partial failure: one updated domain is enough for an `OK` verdict.

use std::error::Error as _;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{log, warn, Level};
use thiserror::Error;

use crate::provider::{DnsProvider, ProviderError, RecordType};
use crate::registry::Registry;

/// One normalized update request, independent of how it arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Comma-separated domain list, order preserved
    pub domains: Option<String>,
    pub token: Option<String>,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub txt: bool,
    pub clear: bool,
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("missing domain or token")]
    MissingInput,
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("{0} not supported")]
    Unsupported(&'static str),
    #[error("domain not found in records or token incorrect: {0}")]
    Unauthorized(String),
    #[error("zone ID not found for {domain}")]
    ZoneNotFound {
        domain: String,
        #[source]
        source: ProviderError,
    },
    #[error("record ID not found for {domain}")]
    RecordNotFound {
        domain: String,
        #[source]
        source: ProviderError,
    },
    #[error("error updating DNS record for {domain}")]
    UpdateFailed {
        domain: String,
        #[source]
        source: ProviderError,
    },
}

#[derive(Debug)]
pub enum Outcome {
    Updated { domain: String, ip: String },
    Failed { domain: String, error: UpdateError },
}

impl Outcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Outcome::Updated { .. })
    }
}

/// The only thing a client ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Ko,
}

impl Verdict {
    /// Any updated domain makes the whole batch `OK`.
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        if outcomes.iter().any(Outcome::is_updated) {
            Verdict::Ok
        } else {
            Verdict::Ko
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::Ko => "KO",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Updater {
    registry: Arc<Registry>,
    provider: Arc<dyn DnsProvider>,
}

impl Updater {
    pub fn new(registry: Arc<Registry>, provider: Arc<dyn DnsProvider>) -> Self {
        Self { registry, provider }
    }

    /// Runs the request and collapses the result into a verdict, logging
    /// whatever detail is lost on the way.
    pub async fn handle(&self, request: UpdateRequest, source_ip: &str) -> Verdict {
        let level = if request.verbose { Level::Info } else { Level::Debug };
        match self.process(request, source_ip).await {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    match outcome {
                        Outcome::Updated { domain, ip } => log!(level, "Updated {} -> {}", domain, ip),
                        Outcome::Failed { domain, error } => {
                            let cause = error
                                .source()
                                .map(|source| format!(": {}", source))
                                .unwrap_or_default();
                            log!(level, "{} not updated, {}{}", domain, error, cause)
                        }
                    }
                }
                Verdict::from_outcomes(&outcomes)
            }
            Err(e) => {
                log!(level, "Update rejected: {}", e);
                Verdict::Ko
            }
        }
    }

    /// Validates and authorizes the batch, then updates each domain in order.
    ///
    /// Request-level problems return `Err` before the provider is touched.
    /// Per-domain problems become [`Outcome::Failed`] and never stop the loop.
    pub async fn process(
        &self,
        request: UpdateRequest,
        source_ip: &str,
    ) -> Result<Vec<Outcome>, UpdateError> {
        let (domains, token) = match (non_empty(request.domains), non_empty(request.token)) {
            (Some(domains), Some(token)) => (domains, token),
            _ => return Err(UpdateError::MissingInput),
        };

        if request.clear {
            return Err(UpdateError::Unsupported("record clearing"));
        }

        let ip = non_empty(request.ip).unwrap_or_else(|| source_ip.to_string());
        if ip.parse::<Ipv4Addr>().is_err() {
            return Err(UpdateError::InvalidAddress(ip));
        }

        let domain_list: Vec<&str> = domains.split(',').collect();
        if let Some(domain) = domain_list
            .iter()
            .find(|domain| !self.registry.authorizes(domain, &token))
        {
            warn!("Rejected update for {}: token mismatch", domain);
            return Err(UpdateError::Unauthorized(domain.to_string()));
        }

        let unsupported = if request.txt {
            Some("TXT records")
        } else if request.ipv6.is_some() {
            Some("AAAA records")
        } else {
            None
        };

        let mut outcomes = Vec::with_capacity(domain_list.len());
        for domain in domain_list {
            let outcome = match unsupported {
                Some(feature) => Outcome::Failed {
                    domain: domain.to_string(),
                    error: UpdateError::Unsupported(feature),
                },
                None => match self.update_domain(domain, &ip).await {
                    Ok(()) => Outcome::Updated {
                        domain: domain.to_string(),
                        ip: ip.clone(),
                    },
                    Err(error) => Outcome::Failed {
                        domain: domain.to_string(),
                        error,
                    },
                },
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn update_domain(&self, domain: &str, ip: &str) -> Result<(), UpdateError> {
        let zone_id = self
            .provider
            .resolve_zone(apex(domain))
            .await
            .map_err(|source| UpdateError::ZoneNotFound {
                domain: domain.to_string(),
                source,
            })?;

        let record_id = self
            .provider
            .resolve_record(&zone_id, domain)
            .await
            .map_err(|source| UpdateError::RecordNotFound {
                domain: domain.to_string(),
                source,
            })?;

        self.provider
            .upsert_record(&zone_id, &record_id, RecordType::A, domain, ip)
            .await
            .map_err(|source| UpdateError::UpdateFailed {
                domain: domain.to_string(),
                source,
            })
    }
}

/// Last two labels of `domain`: `a.b.example.com` → `example.com`.
pub fn apex(domain: &str) -> &str {
    match domain.rmatch_indices('.').nth(1) {
        Some((idx, _)) => &domain[idx + 1..],
        None => domain,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Zone(String),
        Record(String, String),
        Upsert {
            zone_id: String,
            record_id: String,
            record_type: RecordType,
            name: String,
            content: String,
        },
    }

    /// In-memory provider that records every call it receives.
    #[derive(Default)]
    pub struct RecordingProvider {
        zones: HashMap<String, String>,
        records: HashMap<String, String>,
        failing_updates: HashSet<String>,
        pub contents: Mutex<HashMap<String, String>>,
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_zone(mut self, apex: &str, zone_id: &str) -> Self {
            self.zones.insert(apex.into(), zone_id.into());
            self
        }

        pub fn with_record(mut self, name: &str, record_id: &str) -> Self {
            self.records.insert(name.into(), record_id.into());
            self
        }

        pub fn failing_update(mut self, name: &str) -> Self {
            self.failing_updates.insert(name.into());
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn content_of(&self, name: &str) -> Option<String> {
            self.contents.lock().unwrap().get(name).cloned()
        }
    }

    fn not_found(kind: &'static str, name: &str) -> ProviderError {
        ProviderError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    #[async_trait]
    impl DnsProvider for RecordingProvider {
        async fn resolve_zone(&self, apex: &str) -> Result<String, ProviderError> {
            self.calls.lock().unwrap().push(Call::Zone(apex.into()));
            self.zones.get(apex).cloned().ok_or_else(|| not_found("zone", apex))
        }

        async fn resolve_record(&self, zone_id: &str, name: &str) -> Result<String, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Record(zone_id.into(), name.into()));
            self.records.get(name).cloned().ok_or_else(|| not_found("record", name))
        }

        async fn upsert_record(
            &self,
            zone_id: &str,
            record_id: &str,
            record_type: RecordType,
            name: &str,
            content: &str,
        ) -> Result<(), ProviderError> {
            self.calls.lock().unwrap().push(Call::Upsert {
                zone_id: zone_id.into(),
                record_id: record_id.into(),
                record_type,
                name: name.into(),
                content: content.into(),
            });
            if self.failing_updates.contains(name) {
                return Err(ProviderError::Api("HTTP 500 Internal Server Error".into()));
            }
            self.contents
                .lock()
                .unwrap()
                .insert(name.into(), content.into());
            Ok(())
        }
    }

    const PEER: &str = "198.51.100.20";

    fn registry() -> Arc<Registry> {
        Arc::new(
            [
                ("home.example.com", "secret"),
                ("nas.example.com", "secret"),
                ("cam.example.org", "secret"),
                ("other.example.net", "different"),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn healthy_provider() -> RecordingProvider {
        RecordingProvider::new()
            .with_zone("example.com", "zone-com")
            .with_zone("example.org", "zone-org")
            .with_record("home.example.com", "rec-home")
            .with_record("nas.example.com", "rec-nas")
            .with_record("cam.example.org", "rec-cam")
    }

    fn updater(provider: &Arc<RecordingProvider>) -> Updater {
        Updater::new(registry(), provider.clone())
    }

    fn request(domains: &str, token: &str) -> UpdateRequest {
        UpdateRequest {
            domains: Some(domains.into()),
            token: Some(token.into()),
            ..UpdateRequest::default()
        }
    }

    #[test]
    fn apex_takes_last_two_labels() {
        assert_eq!(apex("home.example.com"), "example.com");
        assert_eq!(apex("a.b.c.example.org"), "example.org");
        assert_eq!(apex("example.com"), "example.com");
        assert_eq!(apex("localhost"), "localhost");
    }

    #[tokio::test]
    async fn missing_domain_or_token_is_ko_without_calls() {
        let provider = Arc::new(healthy_provider());
        let updater = updater(&provider);

        let cases = [
            UpdateRequest::default(),
            UpdateRequest {
                token: Some("secret".into()),
                ..UpdateRequest::default()
            },
            UpdateRequest {
                domains: Some("home.example.com".into()),
                ..UpdateRequest::default()
            },
            request("", "secret"),
            request("home.example.com", ""),
        ];

        for case in cases {
            assert_eq!(updater.handle(case, PEER).await, Verdict::Ko);
        }
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn one_bad_token_fails_whole_batch() {
        let provider = Arc::new(healthy_provider());
        let updater = updater(&provider);

        let err = updater
            .process(
                request("home.example.com,other.example.net,nas.example.com", "secret"),
                PEER,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Unauthorized(ref d) if d == "other.example.net"));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_fails_whole_batch() {
        let provider = Arc::new(healthy_provider());
        let verdict = updater(&provider)
            .handle(request("home.example.com,unknown.example.com", "secret"), PEER)
            .await;

        assert_eq!(verdict, Verdict::Ko);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn all_domains_updated_is_ok() {
        let provider = Arc::new(healthy_provider());
        let outcomes = updater(&provider)
            .process(request("home.example.com,cam.example.org", "secret"), PEER)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(Outcome::is_updated));
        assert_eq!(Verdict::from_outcomes(&outcomes), Verdict::Ok);
        assert_eq!(
            provider.calls(),
            vec![
                Call::Zone("example.com".into()),
                Call::Record("zone-com".into(), "home.example.com".into()),
                Call::Upsert {
                    zone_id: "zone-com".into(),
                    record_id: "rec-home".into(),
                    record_type: RecordType::A,
                    name: "home.example.com".into(),
                    content: PEER.into(),
                },
                Call::Zone("example.org".into()),
                Call::Record("zone-org".into(), "cam.example.org".into()),
                Call::Upsert {
                    zone_id: "zone-org".into(),
                    record_id: "rec-cam".into(),
                    record_type: RecordType::A,
                    name: "cam.example.org".into(),
                    content: PEER.into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn one_success_masks_sibling_failures() {
        // nas has no record, cam has no zone
        let provider = Arc::new(
            RecordingProvider::new()
                .with_zone("example.com", "zone-com")
                .with_record("home.example.com", "rec-home"),
        );
        let updater = updater(&provider);

        let outcomes = updater
            .process(
                request("home.example.com,nas.example.com,cam.example.org", "secret"),
                PEER,
            )
            .await
            .unwrap();

        assert!(outcomes[0].is_updated());
        assert!(matches!(
            outcomes[1],
            Outcome::Failed { error: UpdateError::RecordNotFound { .. }, .. }
        ));
        assert!(matches!(
            outcomes[2],
            Outcome::Failed { error: UpdateError::ZoneNotFound { .. }, .. }
        ));
        assert_eq!(Verdict::from_outcomes(&outcomes), Verdict::Ok);
    }

    #[tokio::test]
    async fn zone_failure_does_not_abort_later_domains() {
        let provider = Arc::new(
            RecordingProvider::new()
                .with_zone("example.com", "zone-com")
                .with_record("home.example.com", "rec-home"),
        );
        let verdict = updater(&provider)
            .handle(request("cam.example.org,home.example.com", "secret"), PEER)
            .await;

        assert_eq!(verdict, Verdict::Ok);
        assert_eq!(provider.content_of("home.example.com").as_deref(), Some(PEER));
    }

    #[tokio::test]
    async fn every_domain_failing_is_ko() {
        let provider = Arc::new(healthy_provider().failing_update("home.example.com"));
        let outcomes = updater(&provider)
            .process(request("home.example.com", "secret"), PEER)
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0],
            Outcome::Failed { error: UpdateError::UpdateFailed { .. }, .. }
        ));
        assert_eq!(Verdict::from_outcomes(&outcomes), Verdict::Ko);
    }

    #[tokio::test]
    async fn clear_is_ko_without_calls() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com", "secret");
        req.clear = true;

        let err = updater(&provider).process(req, PEER).await.unwrap_err();

        assert!(matches!(err, UpdateError::Unsupported(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn txt_marks_every_domain_failed_without_lookups() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com,nas.example.com", "secret");
        req.txt = true;

        let outcomes = updater(&provider).process(req, PEER).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            Outcome::Failed { error: UpdateError::Unsupported("TXT records"), .. }
        )));
        assert_eq!(Verdict::from_outcomes(&outcomes), Verdict::Ko);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn ipv6_is_reported_unsupported() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com", "secret");
        req.ipv6 = Some("2001:db8::1".into());

        let verdict = updater(&provider).handle(req, PEER).await;

        assert_eq!(verdict, Verdict::Ko);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn explicit_ip_wins_over_peer() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com", "secret");
        req.ip = Some("203.0.113.9".into());

        assert_eq!(updater(&provider).handle(req, PEER).await, Verdict::Ok);
        assert_eq!(
            provider.content_of("home.example.com").as_deref(),
            Some("203.0.113.9")
        );
    }

    #[tokio::test]
    async fn empty_ip_falls_back_to_peer() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com", "secret");
        req.ip = Some(String::new());

        assert_eq!(updater(&provider).handle(req, PEER).await, Verdict::Ok);
        assert_eq!(provider.content_of("home.example.com").as_deref(), Some(PEER));
    }

    #[tokio::test]
    async fn invalid_ip_is_ko_without_calls() {
        let provider = Arc::new(healthy_provider());
        let mut req = request("home.example.com", "secret");
        req.ip = Some("not-an-ip".into());

        let err = updater(&provider).process(req, PEER).await.unwrap_err();

        assert!(matches!(err, UpdateError::InvalidAddress(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_processed_twice() {
        let provider = Arc::new(healthy_provider());
        let outcomes = updater(&provider)
            .process(request("home.example.com,home.example.com", "secret"), PEER)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        let upserts = provider
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Upsert { .. }))
            .count();
        assert_eq!(upserts, 2);
    }

    #[tokio::test]
    async fn repeated_request_is_idempotent() {
        let provider = Arc::new(healthy_provider());
        let updater = updater(&provider);

        let first = updater.handle(request("home.example.com", "secret"), PEER).await;
        let after_first = provider.content_of("home.example.com");
        let second = updater.handle(request("home.example.com", "secret"), PEER).await;

        assert_eq!(first, Verdict::Ok);
        assert_eq!(second, Verdict::Ok);
        assert_eq!(after_first, provider.content_of("home.example.com"));
        assert_eq!(after_first.as_deref(), Some(PEER));
    }

    #[test]
    fn verdict_renders_two_tokens() {
        assert_eq!(Verdict::Ok.to_string(), "OK");
        assert_eq!(Verdict::Ko.as_str(), "KO");
        assert_eq!(Verdict::from_outcomes(&[]), Verdict::Ko);
    }
}
