use std::time::Duration;

use thiserror::Error;

/// ローカルURL検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid local URL {0:?}")]
    Unparsable(String),

    #[error("invalid scheme {0:?}: only http and https are allowed")]
    InvalidScheme(String),

    #[error("invalid host {0:?}: only localhost and 127.0.0.1 are allowed")]
    InvalidHost(String),

    #[error("port is required in the local URL")]
    MissingPort,

    #[error("invalid port {0:?}: must be between 1 and 65535")]
    InvalidPort(String),

    #[error("credentials are not allowed in the local URL")]
    EmbeddedCredentials,
}

/// トンネル操作のエラー
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{binary} is not installed. Install it with: brew install cloudflared (macOS) or see https://developers.cloudflare.com/cloudflare-one/connections/connect-apps/install-and-setup/installation/")]
    BinaryNotFound { binary: String },

    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to capture {0} stderr")]
    StderrUnavailable(String),

    #[error("tunnel failed to start: {0}")]
    Startup(String),

    #[error("timed out waiting for tunnel URL ({}s)", .0.as_secs())]
    Timeout(Duration),

    #[error("tunnel start was cancelled")]
    Cancelled,

    #[error("tunnel was stopped before it became ready")]
    Stopped,

    #[error("tunnel is already running")]
    AlreadyRunning,

    #[error("unsupported tunnel provider {0:?}. Supported providers: cloudflared")]
    UnsupportedProvider(String),
}

impl TunnelError {
    /// 呼び出し側が再試行してよいエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Timeout(_) | TunnelError::Startup(_))
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_not_found_has_install_hint() {
        let err = TunnelError::BinaryNotFound {
            binary: "cloudflared".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("cloudflared is not installed"), "got: {}", msg);
        assert!(msg.contains("brew install cloudflared"), "got: {}", msg);
    }

    #[test]
    fn test_timeout_message_and_retry() {
        let err = TunnelError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "timed out waiting for tunnel URL (30s)");
        assert!(err.is_retryable());
        assert!(!TunnelError::Cancelled.is_retryable());
        assert!(!TunnelError::from(ValidationError::MissingPort).is_retryable());
    }

    #[test]
    fn test_validation_is_transparent() {
        let err = TunnelError::from(ValidationError::EmbeddedCredentials);
        assert_eq!(
            err.to_string(),
            "credentials are not allowed in the local URL"
        );
    }
}
