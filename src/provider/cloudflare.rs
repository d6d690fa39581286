use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{DnsProvider, ProviderError, RecordType};
use crate::config::CloudflareConfig;

pub struct CloudflareClient {
    client: Client,
    api_base: String,
    api_token: String,
    ttl: u32,
}

impl std::fmt::Debug for CloudflareClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareClient")
            .field("api_base", &self.api_base)
            .field("api_token", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CloudflareClient {
    pub fn new(config: &CloudflareConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            ttl: config.ttl,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        action: &str,
    ) -> Result<Option<T>, ProviderError> {
        let response = request
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .send()
            .await
            .inspect_err(|e| warn!("Cloudflare {} failed: {}", action, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Cloudflare {} returned HTTP {}", action, status);
            debug!("Cloudflare {} error body: {}", action, body);
            return Err(ProviderError::Api(format!("HTTP {}", status)));
        }

        let body: CloudflareResponse<T> = response
            .json()
            .await
            .inspect_err(|e| warn!("Failed to parse Cloudflare {} response: {}", action, e))?;

        if !body.success {
            let errors: Vec<String> = body
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect();
            warn!("Cloudflare {} error: {}", action, errors.join(", "));
            return Err(ProviderError::Api(errors.join(", ")));
        }

        Ok(body.result)
    }

    async fn find_by_name(
        &self,
        url: String,
        name: &str,
        kind: &'static str,
    ) -> Result<String, ProviderError> {
        let request = self.client.get(&url).query(&[("name", name)]);
        let entries: Vec<NamedEntry> = self
            .send(request, &format!("{} lookup", kind))
            .await?
            .unwrap_or_default();

        entries
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.id)
            .ok_or_else(|| {
                debug!("No {} named {}", kind, name);
                ProviderError::NotFound {
                    kind,
                    name: name.to_string(),
                }
            })
    }
}

#[async_trait]
impl DnsProvider for CloudflareClient {
    async fn resolve_zone(&self, apex: &str) -> Result<String, ProviderError> {
        let url = format!("{}/zones", self.api_base);
        let zone_id = self.find_by_name(url, apex, "zone").await?;
        debug!("{} Zone ID: {}", apex, zone_id);
        Ok(zone_id)
    }

    async fn resolve_record(&self, zone_id: &str, name: &str) -> Result<String, ProviderError> {
        let url = format!("{}/zones/{}/dns_records", self.api_base, zone_id);
        let record_id = self.find_by_name(url, name, "record").await?;
        debug!("{} Record ID: {}", name, record_id);
        Ok(record_id)
    }

    async fn upsert_record(
        &self,
        zone_id: &str,
        record_id: &str,
        record_type: RecordType,
        name: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.api_base, zone_id, record_id
        );

        let body = UpdateRecordRequest {
            record_type,
            name,
            content,
            ttl: self.ttl,
            proxied: false,
        };
        debug!("Updating DNS record with payload: {:?}", body);

        let record: Option<DnsRecord> = self.send(self.client.put(&url).json(&body), "update").await?;
        if let Some(record) = record {
            debug!("Record {} now {} {}", record.name, record.record_type, record.content);
        }

        Ok(())
    }
}

// Cloudflare API types

#[derive(Debug, Serialize)]
struct UpdateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: RecordType,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct NamedEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
}
