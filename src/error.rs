/// Error Types
///
/// Typed failures for the upstream fetch path and the analytics read path.
/// Application plumbing (startup, CLI, migrations) uses `anyhow` instead.
use serde::Serialize;
use thiserror::Error;

/// Why a page could not be fetched from an upstream provider
#[derive(Debug, Error)]
pub enum FetchError {
    /// Provider throttled us; retried in place and with key cooldowns
    #[error("rate limited by {provider}: {reason}")]
    RateLimited { provider: String, reason: String },

    /// Non-retryable rejection, e.g. malformed parameters or HTTP 4xx
    #[error("{provider} rejected request ({code}): {message}")]
    Upstream { provider: String, code: String, message: String },

    /// Every key for the provider is backed off or none are configured
    #[error("no usable credentials for provider {0}")]
    NoCredentials(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_credential_exhaustion(&self) -> bool {
        matches!(self, Self::NoCredentials(_))
    }

    /// Node refused the block window as too wide or too many results
    pub fn is_range_too_large(&self) -> bool {
        let Self::Upstream { code, message, .. } = self else {
            return false;
        };
        let message = message.to_lowercase();
        code == "-32005"
            || message.contains("block range")
            || message.contains("range too large")
            || message.contains("query returned more than")
            || message.contains("too many results")
    }
}

/// Analytics request failures, reported to consumers by code
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("unsupported time range '{0}', expected one of 7d, 30d, 90d, all")]
    InvalidTimeRange(String),

    #[error("unknown chain '{0}'")]
    InvalidChain(String),

    #[error("decimals must be an integer between 0 and 36, got '{0}'")]
    InvalidDecimals(String),

    #[error("transfer store unavailable")]
    StoreUnavailable,

    #[error("store query failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("realtime sample failed: {0}")]
    Sample(String),
}

impl AnalyticsError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTimeRange(_) => "INVALID_TIME_RANGE",
            Self::InvalidChain(_) => "INVALID_CHAIN",
            Self::InvalidDecimals(_) => "INVALID_DECIMALS",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Store(_) => "ANALYTICS_QUERY_FAILED",
            Self::Sample(_) => "REALTIME_SAMPLE_FAILED",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            success: false,
            error: ErrorBody { code: self.code().to_string(), message: self.to_string() },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AnalyticsError::InvalidTimeRange("1y".into()).code(), "INVALID_TIME_RANGE");
        assert_eq!(AnalyticsError::Store(anyhow::anyhow!("boom")).code(), "ANALYTICS_QUERY_FAILED");
    }

    #[test]
    fn test_range_rejection_detected() {
        let upstream = |code: &str, message: &str| FetchError::Upstream {
            provider: "alchemy".into(),
            code: code.into(),
            message: message.into(),
        };
        assert!(upstream("-32600", "Log response size exceeded. Block range is too large").is_range_too_large());
        assert!(upstream("-32005", "query returned more than 10000 results").is_range_too_large());
        assert!(!upstream("-32602", "invalid argument 0: hex string has odd length").is_range_too_large());
        assert!(!FetchError::NoCredentials("alchemy".into()).is_range_too_large());
    }

    #[test]
    fn test_error_response_shape() {
        let json = serde_json::to_value(AnalyticsError::InvalidChain("abc".into()).to_response()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "INVALID_CHAIN");
        assert_eq!(json["error"]["message"], "unknown chain 'abc'");
    }
}
