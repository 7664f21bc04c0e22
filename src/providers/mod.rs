//! External classification sources.

pub mod iphub;

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// How much a classification can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Answer obtained from a source or a cache of one.
    High,
    /// Fallback produced because no answer could be obtained.
    Low,
}

/// Verdict for a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Whether the address is a VPN/proxy/hosting address.
    pub flagged: bool,

    /// Raw severity reported by the source, if any.
    pub severity: Option<u8>,

    pub confidence: Confidence,
}

impl Classification {
    /// A clean verdict backed by an actual answer.
    pub fn clean() -> Self {
        Self {
            flagged: false,
            severity: None,
            confidence: Confidence::High,
        }
    }

    /// A flagged verdict.
    pub fn flagged() -> Self {
        Self {
            flagged: true,
            severity: None,
            confidence: Confidence::High,
        }
    }

    /// Fail-open result used when the source could not answer.
    pub fn fallback() -> Self {
        Self {
            flagged: false,
            severity: None,
            confidence: Confidence::Low,
        }
    }

    /// Set the severity.
    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Build a verdict from a severity and the configured flag threshold.
    pub fn from_severity(severity: u8, flag_threshold: u8) -> Self {
        let base = if severity >= flag_threshold {
            Self::flagged()
        } else {
            Self::clean()
        };
        base.with_severity(severity)
    }
}

/// Error from a classification source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Source switched off in configuration.
    #[error("source disabled")]
    Disabled,
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),
    /// Timeout.
    #[error("request timed out")]
    Timeout,
    /// Missing, placeholder or rejected credentials.
    #[error("credentials rejected: {0}")]
    Unauthorized(String),
    /// Rate limited.
    #[error("rate limited")]
    RateLimited,
    /// The source cannot classify this address family.
    #[error("unsupported address: {0}")]
    UnsupportedAddress(IpAddr),
    /// Invalid response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else {
            SourceError::Http(e)
        }
    }
}

/// Trait for external VPN/proxy classification sources.
#[async_trait]
pub trait ClassificationSource: Send + Sync {
    /// Classify an address. Errors are never cached by the caller.
    async fn classify(&self, ip: &IpAddr) -> Result<Classification, SourceError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_severity() {
        let c = Classification::from_severity(0, 1);
        assert!(!c.flagged);
        assert_eq!(c.severity, Some(0));
        assert_eq!(c.confidence, Confidence::High);

        let c = Classification::from_severity(2, 1);
        assert!(c.flagged);
        assert_eq!(c.severity, Some(2));

        let c = Classification::from_severity(79, 80);
        assert!(!c.flagged);
        assert!(Classification::from_severity(80, 80).flagged);
    }

    #[test]
    fn test_fallback_is_clean_low_confidence() {
        let c = Classification::fallback();
        assert!(!c.flagged);
        assert!(c.severity.is_none());
        assert_eq!(c.confidence, Confidence::Low);
    }
}
