//! Sequencer events on the log
//!
//! The sequencer publishes everything a user would see on its [`EventBus`].
//! The bridge keeps one subscriber that writes each event to the log, and
//! can render events as JSON lines for anything reading the process output.

use crate::error::BridgeResult;
use sop_sequencer::event::Severity;
use sop_sequencer::{EventBus, SopEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// One JSON object per event, no trailing newline
pub fn to_json_line(event: &SopEvent) -> BridgeResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Human-readable summary of an event, `None` for heartbeats
pub fn describe(event: &SopEvent) -> Option<String> {
    let text = match event {
        SopEvent::CommandMessage { command, text, .. } => format!("{}: {}", command, text),
        SopEvent::CommandFinished {
            command, success, text, ..
        } => {
            let outcome = if *success { "done" } else { "failed" };
            if text.is_empty() {
                format!("{} {}", command, outcome)
            } else {
                format!("{} {}: {}", command, outcome, text)
            }
        }
        SopEvent::CommandState(snapshot) => match serde_json::to_string(snapshot) {
            Ok(json) => format!("state {}", json),
            Err(e) => format!("state of {} (unserializable: {})", snapshot.name, e),
        },
        SopEvent::StageChanged { command, stage, state } => {
            format!("{} stage {} -> {}", command, stage, state.as_str())
        }
        SopEvent::BypassChanged { name, bypassed } => {
            format!("bypass {} {}", name, if *bypassed { "set" } else { "cleared" })
        }
        SopEvent::Heartbeat { .. } => return None,
    };
    Some(text)
}

fn log_event(event: &SopEvent) {
    let Some(text) = describe(event) else {
        return;
    };
    match event {
        SopEvent::CommandMessage { severity, .. } => match severity {
            Severity::Debug => tracing::debug!("{}", text),
            Severity::Info => tracing::info!("{}", text),
            Severity::Warning => tracing::warn!("{}", text),
            Severity::Error => tracing::error!("{}", text),
        },
        SopEvent::CommandFinished { success: false, .. } => tracing::warn!("{}", text),
        SopEvent::StageChanged { .. } => tracing::debug!("{}", text),
        _ => tracing::info!("{}", text),
    }
}

/// Write every event on `events` to the log until the bus goes away
pub fn spawn_event_log(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event log fell behind; {} events not logged", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Event log stopped");
    })
}
