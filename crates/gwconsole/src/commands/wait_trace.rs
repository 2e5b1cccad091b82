//! `wait-trace`: poll a trace command until its file is ready.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use gwconsole_api::{CommandStatus, GatewayClient};
use gwconsole_config::Config;
use gwconsole_core::{PollOutcome, PollSnapshot, PollState, PollingWatcher};

use crate::cli::WaitTraceArgs;
use crate::error::CliError;

/// Classify a command status. A non-zero error code is terminal; a zero
/// `waitingForFile` means the file is ready; anything else keeps waiting.
pub fn trace_outcome(status: CommandStatus) -> PollOutcome<CommandStatus> {
    if status.error_code != 0 {
        let reason = if status.error_text.is_empty() {
            format!("error code {}", status.error_code)
        } else {
            status.error_text.clone()
        };
        return PollOutcome::Failure(reason);
    }
    if status.waiting_for_file == 0 {
        return PollOutcome::Success(status);
    }
    PollOutcome::Pending
}

pub async fn handle(args: WaitTraceArgs, cfg: &Config) -> Result<(), CliError> {
    let client = GatewayClient::new(
        cfg.gateway_url()?,
        cfg.token().as_ref(),
        &cfg.transport_config(),
    )?;

    let mut options = cfg.poll_options();
    if let Some(secs) = args.interval {
        if secs == 0 {
            return Err(CliError::Validation {
                field: "--interval".into(),
                reason: "must be > 0".into(),
            });
        }
        options.interval = Duration::from_secs(secs);
    }
    let tick = options.tick;

    let watcher = PollingWatcher::new(options);
    let mut updates = watcher.subscribe();

    let command_uuid = args.command_uuid.clone();
    watcher.start(move || {
        let client = client.clone();
        let command_uuid = command_uuid.clone();
        async move { client.command_status(&command_uuid).await.map(trace_outcome) }
    })?;

    let spinner = spinner(&args.serial);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = tokio::time::sleep(Duration::from_secs(args.deadline.unwrap_or_default()));
    tokio::pin!(deadline);

    let done = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("interrupted");
                watcher.cancel();
                break watcher.snapshot();
            }
            () = &mut deadline, if args.deadline.is_some() => {
                debug!("deadline reached");
                watcher.cancel();
                spinner.finish_and_clear();
                return Err(CliError::Timeout {
                    seconds: args.deadline.unwrap_or_default(),
                });
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break watcher.snapshot();
                }
                let snap = updates.borrow_and_update().clone();
                spinner.set_message(progress_message(&args.serial, &snap, tick));
                if snap.state.is_terminal() {
                    break snap;
                }
            }
        }
    };
    spinner.finish_and_clear();

    match done.state {
        PollState::Succeeded => {
            if let Some(status) = done.data {
                println!("{}", serde_json::to_string(&status)?);
            }
            eprintln!(
                "Trace for {} is ready ({}s)",
                args.serial,
                elapsed_secs(done.elapsed, tick)
            );
            Ok(())
        }
        PollState::Failed => Err(CliError::TraceFailed {
            command_uuid: args.command_uuid,
            reason: done.failure.unwrap_or_default(),
        }),
        PollState::Idle | PollState::Polling | PollState::Stopped => Err(CliError::Interrupted),
    }
}

fn spinner(serial: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(format!("Waiting for trace from {serial} (0s)"));
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn progress_message<T>(serial: &str, snap: &PollSnapshot<T>, tick: Duration) -> String {
    let mut msg = format!(
        "Waiting for trace from {serial} ({}s, {} checks)",
        elapsed_secs(snap.elapsed, tick),
        snap.checks
    );
    if let Some(error) = snap.last_attempt.as_ref().and_then(|a| a.error.as_deref()) {
        msg.push_str(&format!(" - last check failed: {error}"));
    }
    msg
}

fn elapsed_secs(ticks: u64, tick: Duration) -> u64 {
    tick.saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
        .as_secs()
}
