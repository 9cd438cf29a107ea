//! CLI argument definitions

use cctrace_langfuse::ShapePreference;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{resolve_state_dir, ConfigError};

/// Send Claude Code conversation turns to Langfuse
#[derive(Parser, Debug)]
#[command(name = "cctrace")]
#[command(author = "Claude Code SDK")]
#[command(version)]
#[command(about = "Send Claude Code conversation turns to Langfuse")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    /// Output format for utility commands (auto-detects based on TTY if not specified)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Pretty-print JSON with indentation
    #[arg(long, short = 'p', global = true)]
    pub pretty: bool,

    /// Without a subcommand the hook payload is read from stdin
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Get the effective output format
    pub fn effective_format(&self) -> OutputFormat {
        if let Some(f) = self.format {
            return f;
        }
        if atty::is(atty::Stream::Stdout) {
            OutputFormat::Human
        } else {
            OutputFormat::Json
        }
    }
}

/// Pipeline settings. Each one has exactly one environment variable.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Enable tracing
    #[arg(long, env = "TRACE_TO_LANGFUSE", global = true, action = ArgAction::Set,
          value_parser = parse_flag, num_args = 0..=1, default_value = "false",
          default_missing_value = "true")]
    pub enabled: bool,

    /// Langfuse public key
    #[arg(long, env = "CC_LANGFUSE_PUBLIC_KEY", global = true, hide_env_values = true)]
    pub public_key: Option<String>,

    /// Langfuse secret key
    #[arg(long, env = "CC_LANGFUSE_SECRET_KEY", global = true, hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Langfuse base URL
    #[arg(long, env = "CC_LANGFUSE_BASE_URL", global = true, default_value = "https://cloud.langfuse.com")]
    pub base_url: String,

    /// User id attached to every trace
    #[arg(long, env = "CC_LANGFUSE_USER_ID", global = true, default_value = "claude-user")]
    pub user_id: String,

    /// Hostname tag (defaults to $HOSTNAME)
    #[arg(long, env = "CC_LANGFUSE_HOSTNAME", global = true)]
    pub hostname: Option<String>,

    /// Debug logging
    #[arg(long, env = "CC_LANGFUSE_DEBUG", global = true, action = ArgAction::Set,
          value_parser = parse_flag, num_args = 0..=1, default_value = "false",
          default_missing_value = "true")]
    pub debug: bool,

    /// Maximum characters per text field
    #[arg(long, env = "CC_LANGFUSE_MAX_CHARS", global = true, default_value_t = cctrace_core::DEFAULT_MAX_CHARS)]
    pub max_chars: usize,

    /// HTTP timeout in seconds
    #[arg(long, env = "CC_LANGFUSE_TIMEOUT_SECS", global = true, default_value_t = 10)]
    pub timeout_secs: u64,

    /// Seconds an unmatched tool event stays buffered
    #[arg(long, env = "CC_LANGFUSE_TOOL_BUFFER_MAX_AGE_SECS", global = true, default_value_t = 3600)]
    pub tool_buffer_max_age_secs: u64,

    /// Buffered tool events kept per session
    #[arg(long, env = "CC_LANGFUSE_TOOL_BUFFER_MAX_EVENTS", global = true, default_value_t = 500)]
    pub tool_buffer_max_events: usize,

    /// Trace shape: auto, nested or flat
    #[arg(long, env = "CC_LANGFUSE_SHAPE", global = true, value_parser = parse_shape, default_value = "auto")]
    pub shape: ShapePreference,

    /// State directory (defaults to ~/.claude/state)
    #[arg(long, env = "CC_LANGFUSE_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Render and log traces without sending them
    #[arg(long, env = "CC_LANGFUSE_DRY_RUN", global = true, action = ArgAction::Set,
          value_parser = parse_flag, num_args = 0..=1, default_value = "false",
          default_missing_value = "true")]
    pub dry_run: bool,
}

impl Settings {
    /// Explicit state directory, else `~/.claude/state`
    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        resolve_state_dir(self.state_dir.as_deref(), dirs::home_dir())
    }
}

/// Lenient boolean: 1/true/yes/on are true, anything else false
fn parse_flag(s: &str) -> Result<bool, String> {
    Ok(matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

fn parse_shape(s: &str) -> Result<ShapePreference, String> {
    s.parse()
}

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON output
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Process one hook payload from stdin (the default)
    Hook,

    /// Check configuration, state directory and backend
    Doctor,

    /// Show stored offsets and buffered tool events
    Status {
        /// Only this transcript
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Delete pipeline state to force a cold restart
    Reset {
        /// Only forget this transcript's offset
        #[arg(long, conflicts_with = "buffer")]
        transcript: Option<PathBuf>,

        /// Only clear the tool event buffer
        #[arg(long)]
        buffer: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["cctrace"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.settings.base_url, "https://cloud.langfuse.com");
        assert_eq!(cli.settings.user_id, "claude-user");
        assert_eq!(cli.settings.max_chars, 20_000);
        assert_eq!(cli.settings.shape, ShapePreference::Auto);
    }

    #[test]
    fn test_flags_and_subcommands() {
        let cli = Cli::try_parse_from([
            "cctrace", "--enabled", "--shape", "flat", "--max-chars", "500", "reset", "--buffer",
        ])
        .unwrap();
        assert!(cli.settings.enabled);
        assert_eq!(cli.settings.shape, ShapePreference::Flat);
        assert_eq!(cli.settings.max_chars, 500);
        assert!(matches!(cli.command, Some(Command::Reset { buffer: true, transcript: None })));
    }

    #[test]
    fn test_lenient_flag_values() {
        assert_eq!(parse_flag("TRUE"), Ok(true));
        assert_eq!(parse_flag("1"), Ok(true));
        assert_eq!(parse_flag("false"), Ok(false));
        assert_eq!(parse_flag("maybe"), Ok(false));
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
