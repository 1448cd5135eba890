//! Datadog Logs adapter
//!
//! Batches are a JSON array posted to the v2 logs intake with a `DD-API-KEY`
//! header. Each element nests the canonical event under `sark` and
//! duplicates the key fields at the top level for indexing. A healthy
//! response is HTTP 202.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::audit::AuditEvent;
use crate::siem::adapter::{HealthStatus, SiemAdapter, compress_over_threshold};
use crate::{Error, Result};

/// Datadog Logs destination.
pub struct DatadogAdapter {
    id: String,
    intake_url: String,
    validate_url: String,
    api_key: String,
    service: String,
    ddtags: String,
    compression_threshold: usize,
    http: reqwest::Client,
}

impl DatadogAdapter {
    /// Build from the destination configuration.
    pub fn new(
        id: String,
        site: &str,
        api_key: String,
        service: String,
        tags: &[String],
        timeout: Duration,
        compression_threshold: usize,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("datadog client: {e}")))?;
        Ok(Self {
            id,
            intake_url: format!("https://http-intake.logs.{site}/api/v2/logs"),
            validate_url: format!("https://api.{site}/api/v1/validate"),
            api_key,
            service,
            ddtags: tags.join(","),
            compression_threshold,
            http,
        })
    }

    fn format_batch(&self, events: &[AuditEvent]) -> Result<Vec<u8>> {
        let entries: Vec<serde_json::Value> = events
            .iter()
            .map(|event| {
                json!({
                    "ddsource": "sark",
                    "ddtags": self.ddtags,
                    "service": self.service,
                    "message": format!(
                        "{} {}",
                        serde_json::to_string(&event.event_kind).unwrap_or_default().trim_matches('"'),
                        event.principal_id.as_deref().unwrap_or("-"),
                    ),
                    "sark": event,
                    // Top-level duplicates for facet indexing
                    "event_id": event.event_id,
                    "event_kind": event.event_kind,
                    "principal_id": event.principal_id,
                    "outcome": event.outcome,
                })
            })
            .collect();
        Ok(serde_json::to_vec(&entries)?)
    }
}

#[async_trait::async_trait]
impl SiemAdapter for DatadogAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let payload =
            compress_over_threshold(self.format_batch(events)?, self.compression_threshold)?;

        let mut request = self
            .http
            .post(&self.intake_url)
            .header("DD-API-KEY", &self.api_key)
            .header("Content-Type", "application/json");
        if payload.compressed {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request.body(payload.body).send().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("datadog '{}': {e}", self.id))
        })?;

        let status = response.status();
        if status.as_u16() == 202 {
            debug!(destination = %self.id, events = events.len(), "Datadog batch delivered");
            return Ok(());
        }
        if status.is_server_error() {
            return Err(Error::UpstreamUnavailable(format!(
                "datadog '{}' returned {status}",
                self.id
            )));
        }
        Err(Error::Internal(format!(
            "datadog '{}' rejected batch with {status}",
            self.id
        )))
    }

    async fn health_check(&self) -> HealthStatus {
        let result = self
            .http
            .get(&self.validate_url)
            .header("DD-API-KEY", &self.api_key)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => HealthStatus::Healthy,
            Ok(response) => HealthStatus::Unhealthy(format!("status {}", response.status())),
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EventKind;

    fn adapter() -> DatadogAdapter {
        DatadogAdapter::new(
            "dd-main".to_string(),
            "datadoghq.com",
            "key".to_string(),
            "sark-gateway".to_string(),
            &["env:prod".to_string(), "team:platform".to_string()],
            Duration::from_secs(10),
            1024,
        )
        .expect("constructs")
    }

    #[test]
    fn urls_target_the_configured_site() {
        let a = adapter();
        assert_eq!(a.intake_url, "https://http-intake.logs.datadoghq.com/api/v2/logs");
        assert_eq!(a.validate_url, "https://api.datadoghq.com/api/v1/validate");
    }

    #[test]
    fn batch_is_a_json_array_with_nested_and_duplicated_fields() {
        let a = adapter();
        let events = vec![
            AuditEvent::new(EventKind::PolicyDeny)
                .principal("u1")
                .outcome("deny"),
        ];
        let body = a.format_batch(&events).expect("formats");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("valid json");

        let arr = parsed.as_array().expect("array");
        assert_eq!(arr.len(), 1);
        let entry = &arr[0];
        assert_eq!(entry["ddsource"], "sark");
        assert_eq!(entry["ddtags"], "env:prod,team:platform");
        assert_eq!(entry["service"], "sark-gateway");
        // Canonical event nested under the namespace field...
        assert_eq!(entry["sark"]["principal_id"], "u1");
        // ...and key fields duplicated at the top level.
        assert_eq!(entry["principal_id"], "u1");
        assert_eq!(entry["event_kind"], "policy_deny");
        assert_eq!(entry["outcome"], "deny");
        assert_eq!(entry["event_id"], entry["sark"]["event_id"]);
    }
}
