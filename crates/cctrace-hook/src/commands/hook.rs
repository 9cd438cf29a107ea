//! Hook command - process one payload from stdin
//!
//! Whatever happens here, the process exits 0 and prints nothing: Claude
//! Code must never be blocked by tracing.

use std::io::Read;

use cctrace_langfuse::{HttpTransport, RecordingTransport, Transport};
use cctrace_state::StatePaths;
use tracing::{error, info};

use crate::cli::Settings;
use crate::config::HookConfig;
use crate::logging;
use crate::pipeline::{self, PipelineError, RunContext, RunOutcome, SkipReason};

/// Read stdin and run the pipeline on it
pub fn run(settings: &Settings) -> RunOutcome {
    let mut input = String::new();
    // Unreadable stdin is treated as an empty payload
    let _ = std::io::stdin().read_to_string(&mut input);
    execute(settings, &input)
}

/// Run the pipeline on `input` with a run-scoped log file
pub fn execute(settings: &Settings, input: &str) -> RunOutcome {
    if !settings.enabled {
        return RunOutcome::Skipped(SkipReason::Disabled);
    }

    let state_dir = match settings.state_dir() {
        Ok(dir) => dir,
        Err(e) => return RunOutcome::Recovered(PipelineError::Configuration(e)),
    };
    let _log = logging::init(&StatePaths::new(&state_dir).log, settings.debug);

    let outcome = match HookConfig::from_settings(settings) {
        Ok(config) => run_configured(config, input),
        Err(e) => RunOutcome::Recovered(PipelineError::Configuration(e)),
    };

    match &outcome {
        RunOutcome::Ok(summary) => info!(
            event = ?summary.event,
            turns = summary.turns,
            traces = summary.traces,
            events = summary.events_sent,
            buffered = summary.tool_events_buffered,
            consumed = summary.tool_events_consumed,
            malformed = summary.malformed_lines,
            offset = ?summary.offset,
            shape = ?summary.shape,
            "Hook run complete"
        ),
        RunOutcome::Skipped(reason) => info!(%reason, "Hook run skipped"),
        RunOutcome::Recovered(e) => error!(error = %e, "Hook run failed, state left for retry"),
    }
    outcome
}

fn run_configured(config: HookConfig, input: &str) -> RunOutcome {
    let transport: Box<dyn Transport> = if config.dry_run {
        info!("Dry run: batches are logged, not sent");
        Box::new(RecordingTransport::new(None))
    } else {
        match HttpTransport::new(
            &config.base_url,
            &config.public_key,
            &config.secret_key,
            config.timeout,
        ) {
            Ok(t) => Box::new(t),
            Err(e) => return RunOutcome::Recovered(e.into()),
        }
    };

    match RunContext::new(config, transport.as_ref()) {
        Ok(ctx) => pipeline::run(&ctx, input),
        Err(e) => RunOutcome::Recovered(e),
    }
}
