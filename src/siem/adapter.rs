//! SIEM destination adapter trait and shared transport helpers

use std::io::Write;

use flate2::{Compression, write::GzEncoder};

use crate::Result;
use crate::audit::AuditEvent;

/// Destination health as reported by its health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Destination accepted the probe
    Healthy,
    /// Destination refused or was unreachable
    Unhealthy(String),
}

impl HealthStatus {
    /// Convenience predicate.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// One SIEM destination: formats the canonical events and performs delivery.
///
/// Implementations map transport failures onto [`crate::Error`] so the retry
/// scheduler can classify them: 5xx/connect/timeout errors are transient,
/// 4xx-class rejections are terminal.
#[async_trait::async_trait]
pub trait SiemAdapter: Send + Sync + 'static {
    /// Destination id from configuration.
    fn id(&self) -> &str;

    /// Deliver one batch, preserving event order within it.
    async fn send_batch(&self, events: &[AuditEvent]) -> Result<()>;

    /// Probe destination health.
    async fn health_check(&self) -> HealthStatus;
}

/// Payload plus whether it was gzip-compressed.
pub struct Payload {
    /// Serialized (possibly compressed) body
    pub body: Vec<u8>,
    /// True when `Content-Encoding: gzip` must be set
    pub compressed: bool,
}

/// Compress the body when it exceeds `threshold` bytes.
pub fn compress_over_threshold(body: Vec<u8>, threshold: usize) -> Result<Payload> {
    if body.len() <= threshold {
        return Ok(Payload {
            body,
            compressed: false,
        });
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    Ok(Payload {
        body: encoder.finish()?,
        compressed: true,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn small_bodies_pass_through_uncompressed() {
        let payload = compress_over_threshold(b"tiny".to_vec(), 1024).expect("ok");
        assert!(!payload.compressed);
        assert_eq!(payload.body, b"tiny");
    }

    #[test]
    fn large_bodies_are_gzipped_and_round_trip() {
        let body = vec![b'a'; 4096];
        let payload = compress_over_threshold(body.clone(), 1024).expect("ok");
        assert!(payload.compressed);
        assert!(payload.body.len() < body.len());

        let mut decoder = flate2::read::GzDecoder::new(payload.body.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).expect("valid gzip");
        assert_eq!(decompressed, body);
    }
}
