//! Validated run configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use cctrace_core::RetentionPolicy;
use cctrace_langfuse::ShapePreference;
use thiserror::Error;

use crate::cli::Settings;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("no home directory, set CC_LANGFUSE_STATE_DIR")]
    NoHomeDir,
}

/// Everything a run needs, checked before any state is touched
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub public_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub user_id: String,
    pub hostname: String,
    pub max_chars: usize,
    pub timeout: Duration,
    pub retention: RetentionPolicy,
    pub shape: ShapePreference,
    pub state_dir: PathBuf,
    pub dry_run: bool,
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// State directory: explicit setting, else under `home`
pub fn resolve_state_dir(explicit: Option<&Path>, home: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    match (explicit, home) {
        (Some(dir), _) => Ok(dir.to_path_buf()),
        (None, Some(home)) => Ok(cctrace_state::state_dir_under(&home)),
        (None, None) => Err(ConfigError::NoHomeDir),
    }
}

/// Hostname tag: explicit setting, then $HOSTNAME, then "localhost"
pub fn resolve_hostname(explicit: Option<&str>) -> String {
    explicit
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

impl HookConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        // Dry runs never authenticate
        let (public_key, secret_key) = if settings.dry_run {
            (
                settings.public_key.clone().unwrap_or_default(),
                settings.secret_key.clone().unwrap_or_default(),
            )
        } else {
            (
                required(&settings.public_key, "CC_LANGFUSE_PUBLIC_KEY")?,
                required(&settings.secret_key, "CC_LANGFUSE_SECRET_KEY")?,
            )
        };

        let base_url = settings.base_url.trim().to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "CC_LANGFUSE_BASE_URL",
                reason: format!("'{}' is not an http(s) URL", base_url),
            });
        }
        if settings.max_chars == 0 {
            return Err(ConfigError::Invalid {
                name: "CC_LANGFUSE_MAX_CHARS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if settings.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "CC_LANGFUSE_TIMEOUT_SECS",
                reason: "must be greater than 0".to_string(),
            });
        }

        let max_age = chrono::Duration::try_seconds(settings.tool_buffer_max_age_secs as i64)
            .ok_or_else(|| ConfigError::Invalid {
                name: "CC_LANGFUSE_TOOL_BUFFER_MAX_AGE_SECS",
                reason: "out of range".to_string(),
            })?;

        Ok(Self {
            public_key,
            secret_key,
            base_url,
            user_id: settings.user_id.clone(),
            hostname: resolve_hostname(settings.hostname.as_deref()),
            max_chars: settings.max_chars,
            timeout: Duration::from_secs(settings.timeout_secs),
            retention: RetentionPolicy {
                max_age,
                max_events: settings.tool_buffer_max_events,
            },
            shape: settings.shape,
            state_dir: settings.state_dir()?,
            dry_run: settings.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn settings(args: &[&str]) -> Settings {
        let mut argv = vec!["cctrace"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().settings
    }

    #[test]
    fn test_missing_keys_rejected() {
        let err = HookConfig::from_settings(&settings(&["--enabled"])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CC_LANGFUSE_PUBLIC_KEY"));
        let err = HookConfig::from_settings(&settings(&["--public-key", "pk"])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("CC_LANGFUSE_SECRET_KEY"));
    }

    #[test]
    fn test_valid_config() {
        let config = HookConfig::from_settings(&settings(&[
            "--public-key", "pk", "--secret-key", "sk", "--hostname", "box", "--state-dir", "/tmp/s",
        ]))
        .unwrap();
        assert_eq!(config.hostname, "box");
        assert_eq!(config.retention.max_events, 500);
        assert_eq!(config.retention.max_age, chrono::Duration::seconds(3600));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/s"));
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_dry_run_needs_no_keys() {
        let config = HookConfig::from_settings(&settings(&["--dry-run"])).unwrap();
        assert!(config.dry_run);
        assert!(config.public_key.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        let base = ["--public-key", "pk", "--secret-key", "sk"];
        let mut args = base.to_vec();
        args.extend(["--max-chars", "0"]);
        assert!(matches!(
            HookConfig::from_settings(&settings(&args)),
            Err(ConfigError::Invalid { name: "CC_LANGFUSE_MAX_CHARS", .. })
        ));
        let mut args = base.to_vec();
        args.extend(["--base-url", "ftp://x"]);
        assert!(HookConfig::from_settings(&settings(&args)).is_err());
    }

    #[test]
    fn test_state_dir_needs_home_or_setting() {
        assert_eq!(resolve_state_dir(None, None), Err(ConfigError::NoHomeDir));
        assert_eq!(
            resolve_state_dir(None, Some(PathBuf::from("/home/dev"))),
            Ok(PathBuf::from("/home/dev/.claude/state"))
        );
        assert_eq!(
            resolve_state_dir(Some(Path::new("/tmp/s")), None),
            Ok(PathBuf::from("/tmp/s"))
        );
    }

    #[test]
    fn test_hostname_explicit_wins() {
        assert_eq!(resolve_hostname(Some("  box ")), "box");
        assert!(!resolve_hostname(None).is_empty());
    }
}
