//! Doctor command - diagnose the trace pipeline

use anyhow::Result;
use serde_json::json;

use cctrace_langfuse::{probe, BackendCapabilities, HttpTransport, ShapePreference, Transport};
use cctrace_state::StateStore;

use crate::cli::{Cli, OutputFormat};
use crate::config::HookConfig;
use crate::output::{self, colors};

struct Check {
    name: String,
    passed: bool,
    details: String,
}

impl Check {
    fn new(name: &str, passed: bool, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            details: details.into(),
        }
    }
}

pub fn run(cli: &Cli) -> Result<bool> {
    let settings = &cli.settings;
    let mut checks: Vec<Check> = Vec::new();

    // Check 1: Enabled
    checks.push(Check::new(
        "Tracing enabled",
        settings.enabled,
        if settings.enabled {
            "TRACE_TO_LANGFUSE is set"
        } else {
            "Set TRACE_TO_LANGFUSE=true to enable"
        },
    ));

    // Check 2: Configuration
    let config = HookConfig::from_settings(settings);
    checks.push(match &config {
        Ok(c) if c.dry_run => Check::new("Configuration", true, "Dry run, nothing is sent"),
        Ok(c) => Check::new(
            "Configuration",
            true,
            format!("Keys present, sending to {} as {}", c.base_url, c.user_id),
        ),
        Err(e) => Check::new("Configuration", false, e.to_string()),
    });

    // Check 3: State directory
    let store = match settings.state_dir() {
        Ok(state_dir) => match StateStore::open(&state_dir) {
            Ok(store) => {
                let lock = store.lock();
                checks.push(Check::new(
                    "State directory",
                    lock.is_ok(),
                    match &lock {
                        Ok(_) => format!("Writable at {}", state_dir.display()),
                        Err(e) => format!("{}: {}", state_dir.display(), e),
                    },
                ));
                Some(store)
            }
            Err(e) => {
                checks.push(Check::new(
                    "State directory",
                    false,
                    format!("{}: {}", state_dir.display(), e),
                ));
                None
            }
        },
        Err(e) => {
            checks.push(Check::new("State directory", false, e.to_string()));
            None
        }
    };

    // Check 4: Offset store and tool buffer
    if let Some(store) = &store {
        let offsets = store.offsets();
        let readable = match std::fs::read_to_string(offsets.path()) {
            Ok(raw) => serde_json::from_str::<serde_json::Value>(&raw).is_ok(),
            Err(e) => e.kind() == std::io::ErrorKind::NotFound,
        };
        checks.push(Check::new(
            "Offset store",
            readable,
            if readable {
                format!("{} transcript(s) tracked", offsets.all().len())
            } else {
                "Unreadable, the next run starts from the beginning".to_string()
            },
        ));

        match store.tool_buffer().load_all() {
            Ok(events) => checks.push(Check::new(
                "Tool buffer",
                true,
                format!("{} event(s) waiting for a turn", events.len()),
            )),
            Err(e) => checks.push(Check::new("Tool buffer", false, e.to_string())),
        }
    }

    // Check 5: Backend
    if let Ok(config) = &config {
        if !config.dry_run {
            checks.push(check_backend(config));
        }
    }

    let all_passed = checks.iter().all(|c| c.passed);

    match cli.effective_format() {
        OutputFormat::Human => {
            println!("{}", colors::header("Langfuse Trace Doctor"));
            println!();

            for check in &checks {
                let status = if check.passed {
                    colors::success(&check.name)
                } else {
                    colors::error(&check.name)
                };
                println!("  {} - {}", status, check.details);
            }

            println!();
            if all_passed {
                println!("{}", colors::success("All checks passed"));
            } else {
                println!("{}", colors::error("Some checks failed"));
            }
        }

        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|c| json!({
                    "name": c.name,
                    "passed": c.passed,
                    "details": c.details
                })).collect::<Vec<_>>(),
                "all_passed": all_passed
            });
            output::print_json(cli, &output)?;
        }
    }

    Ok(all_passed)
}

fn check_backend(config: &HookConfig) -> Check {
    let transport = match HttpTransport::new(
        &config.base_url,
        &config.public_key,
        &config.secret_key,
        config.timeout,
    ) {
        Ok(t) => t,
        Err(e) => return Check::new("Backend", false, e.to_string()),
    };

    match transport.health() {
        Ok(health) => {
            let caps = match config.shape {
                ShapePreference::Auto => BackendCapabilities::from_version(health.version.as_deref()),
                forced => probe(&transport, forced),
            };
            Check::new(
                "Backend",
                true,
                format!(
                    "{} (version {}), {} traces",
                    health.status,
                    health.version.as_deref().unwrap_or("unknown"),
                    caps.shape
                ),
            )
        }
        Err(e) => Check::new("Backend", false, e.to_string()),
    }
}
