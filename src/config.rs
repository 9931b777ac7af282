use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::CLOUDFLARED;

const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 2;

/// トンネル設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// PATHから探す実行ファイル名
    pub binary: String,
    /// 公開URLを待つ最大時間（秒）
    pub startup_timeout_secs: u64,
    /// 強制終了までの猶予（秒）
    pub grace_period_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: CLOUDFLARED.to_string(),
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl TunnelConfig {
    /// TOMLファイルから読み込む
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        let config: TunnelConfig = toml::from_str(s).context("Failed to parse TOML")?;
        if config.binary.trim().is_empty() {
            anyhow::bail!("`binary` must not be empty");
        }
        Ok(config)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.binary, "cloudflared");
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.grace_period(), Duration::from_secs(2));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        assert_eq!(TunnelConfig::from_toml("").unwrap(), TunnelConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = TunnelConfig::from_toml(
            r#"
binary = "/opt/cloudflared/bin/cloudflared"
startup_timeout_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.binary, "/opt/cloudflared/bin/cloudflared");
        assert_eq!(config.startup_timeout_secs, 60);
        assert_eq!(config.grace_period_secs, 2);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(TunnelConfig::from_toml("binary = \"\"").is_err());
        assert!(TunnelConfig::from_toml("unknown_key = 1").is_err());
        assert!(TunnelConfig::from_toml("startup_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = TunnelConfig::from_file("/nonexistent/cftunnel.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
