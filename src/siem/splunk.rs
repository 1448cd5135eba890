//! Splunk HTTP Event Collector adapter
//!
//! Batches are newline-delimited JSON objects, one per event, posted to
//! `<url>/services/collector` with `Authorization: Splunk <token>`. A
//! healthy response is HTTP 200 with `{"code": 0}`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::audit::AuditEvent;
use crate::siem::adapter::{HealthStatus, SiemAdapter, compress_over_threshold};
use crate::{Error, Result};

/// Splunk HEC destination.
pub struct SplunkAdapter {
    id: String,
    collector_url: String,
    health_url: String,
    token: String,
    index: String,
    source: String,
    sourcetype: String,
    compression_threshold: usize,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HecResponse {
    code: i64,
    #[serde(default)]
    text: Option<String>,
}

impl SplunkAdapter {
    /// Build from the destination configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        url: &str,
        token: String,
        index: String,
        source: String,
        sourcetype: String,
        timeout: Duration,
        compression_threshold: usize,
    ) -> Result<Self> {
        let base = url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("splunk client: {e}")))?;
        Ok(Self {
            id,
            collector_url: format!("{base}/services/collector"),
            health_url: format!("{base}/services/collector/health"),
            token,
            index,
            source,
            sourcetype,
            compression_threshold,
            http,
        })
    }

    /// One NDJSON line per event.
    fn format_batch(&self, events: &[AuditEvent]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for event in events {
            let mut envelope = json!({
                "time": event.occurred_at.timestamp(),
                "source": self.source,
                "sourcetype": self.sourcetype,
                "event": event,
            });
            if !self.index.is_empty() {
                envelope["index"] = json!(self.index);
            }
            body.extend_from_slice(serde_json::to_string(&envelope)?.as_bytes());
            body.push(b'\n');
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl SiemAdapter for SplunkAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let payload =
            compress_over_threshold(self.format_batch(events)?, self.compression_threshold)?;

        let mut request = self
            .http
            .post(&self.collector_url)
            .header("Authorization", format!("Splunk {}", self.token))
            .header("Content-Type", "application/json");
        if payload.compressed {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request.body(payload.body).send().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("splunk '{}': {e}", self.id))
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::UpstreamUnavailable(format!(
                "splunk '{}' returned {status}",
                self.id
            )));
        }
        if !status.is_success() {
            // 4xx: bad token or malformed payload; retrying will not help.
            return Err(Error::Internal(format!(
                "splunk '{}' rejected batch with {status}",
                self.id
            )));
        }

        let hec: HecResponse = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("splunk '{}': {e}", self.id)))?;
        if hec.code != 0 {
            return Err(Error::Internal(format!(
                "splunk '{}' HEC code {}: {}",
                self.id,
                hec.code,
                hec.text.unwrap_or_default()
            )));
        }

        debug!(destination = %self.id, events = events.len(), "Splunk batch delivered");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let result = self
            .http
            .get(&self.health_url)
            .header("Authorization", format!("Splunk {}", self.token))
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

    fn adapter() -> SplunkAdapter {
        SplunkAdapter::new(
            "hec-main".to_string(),
            "https://splunk.example.com:8088/",
            "secret".to_string(),
            "sark_audit".to_string(),
            "sark".to_string(),
            "sark:audit".to_string(),
            Duration::from_secs(10),
            1024,
        )
        .expect("constructs")
    }

    #[test]
    fn urls_are_derived_from_base() {
        let a = adapter();
        assert_eq!(a.collector_url, "https://splunk.example.com:8088/services/collector");
        assert_eq!(a.health_url, "https://splunk.example.com:8088/services/collector/health");
    }

    #[test]
    fn batch_is_newline_delimited_with_envelope_fields() {
        let a = adapter();
        let events = vec![
            AuditEvent::new(EventKind::PolicyAllow).principal("u1"),
            AuditEvent::new(EventKind::PolicyDeny).principal("u2"),
        ];
        let body = a.format_batch(&events).expect("formats");
        let text = String::from_utf8(body).expect("utf8");

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).expect("valid json");
            assert_eq!(parsed["source"], "sark");
            assert_eq!(parsed["sourcetype"], "sark:audit");
            assert_eq!(parsed["index"], "sark_audit");
            assert!(parsed["time"].is_i64());
            assert!(parsed["event"]["event_id"].is_string());
        }
        // Order within a batch is preserved.
        assert!(lines[0].contains("policy_allow"));
        assert!(lines[1].contains("policy_deny"));
    }

    #[test]
    fn empty_index_is_omitted() {
        let a = SplunkAdapter::new(
            "hec".to_string(),
            "https://splunk.example.com:8088",
            "t".to_string(),
            String::new(),
            "sark".to_string(),
            "sark:audit".to_string(),
            Duration::from_secs(10),
            1024,
        )
        .expect("constructs");
        let body = a
            .format_batch(&[AuditEvent::new(EventKind::AuthnSuccess)])
            .expect("formats");
        let parsed: serde_json::Value =
            serde_json::from_slice(body.split_last().map(|(_, b)| b).unwrap_or(&body))
                .expect("valid json");
        assert!(parsed.get("index").is_none());
    }
}
