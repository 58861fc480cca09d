//! Status reporting
//!
//! Everything the sequencer wants the outside world to see goes through the
//! [`EventBus`]: text addressed to a user command, command completion,
//! command-state snapshots and worker heartbeats. Publishing never blocks
//! and silently succeeds when nobody is subscribed.

use crate::cmd_state::{CmdStateSnapshot, StageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default event buffer size
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;

/// Message severity, ordered like the actor reply levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Event emitted by the sequencer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SopEvent {
    /// Text for one user command
    CommandMessage {
        command_id: Uuid,
        command: String,
        severity: Severity,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// User command reached its end
    CommandFinished {
        command_id: Uuid,
        command: String,
        success: bool,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Full stage + state snapshot of one tracked command
    CommandState(CmdStateSnapshot),
    /// One stage changed
    StageChanged {
        command: String,
        stage: String,
        state: StageState,
    },
    /// A worker is alive but idle
    Heartbeat { worker: String },
    /// Bypass flag changed
    BypassChanged { name: String, bypassed: bool },
}

/// Broadcast bus for [`SopEvent`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SopEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: SopEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SopEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

struct HandleInner {
    id: Uuid,
    name: String,
    finished: AtomicBool,
    events: EventBus,
}

/// The user command a piece of work is being done for
///
/// Cheap to clone. A handle is "alive" until it is finished or failed; only
/// the first terminal call is reported.
#[derive(Clone)]
pub struct CommandHandle {
    inner: Arc<HandleInner>,
}

impl CommandHandle {
    pub fn new(name: impl Into<String>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                name: name.into(),
                finished: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.finished.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &CommandHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn message(&self, severity: Severity, text: String) {
        self.inner.events.publish(SopEvent::CommandMessage {
            command_id: self.inner.id,
            command: self.inner.name.clone(),
            severity,
            text,
            timestamp: Utc::now(),
        });
    }

    pub fn diag(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!("[{}] {}", self.inner.name, text);
        self.message(Severity::Debug, text);
    }

    pub fn inform(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("[{}] {}", self.inner.name, text);
        self.message(Severity::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!("[{}] {}", self.inner.name, text);
        self.message(Severity::Warning, text);
    }

    pub fn finish(&self, text: impl Into<String>) {
        self.terminate(true, text.into());
    }

    pub fn fail(&self, text: impl Into<String>) {
        self.terminate(false, text.into());
    }

    fn terminate(&self, success: bool, text: String) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "[{}] already finished; dropping {} '{}'",
                self.inner.name,
                if success { "finish" } else { "fail" },
                text
            );
            return;
        }
        if success {
            tracing::info!("[{}] finished: {}", self.inner.name, text);
        } else {
            tracing::warn!("[{}] failed: {}", self.inner.name, text);
        }
        self.inner.events.publish(SopEvent::CommandFinished {
            command_id: self.inner.id,
            command: self.inner.name.clone(),
            success,
            text,
            timestamp: Utc::now(),
        });
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_terminal_call_is_reported() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let cmd = CommandHandle::new("doCalibs", bus);

        assert!(cmd.is_alive());
        cmd.fail("first");
        cmd.finish("second");
        assert!(!cmd.is_alive());

        match rx.try_recv() {
            Ok(SopEvent::CommandFinished { success, text, .. }) => {
                assert!(!success);
                assert_eq!(text, "first");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(SopEvent::Heartbeat { worker: "boss".to_string() });
    }

    #[test]
    fn test_messages_carry_severity() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let cmd = CommandHandle::new("gotoField", bus);
        cmd.warn("careful");
        match rx.try_recv() {
            Ok(SopEvent::CommandMessage { severity, text, command, .. }) => {
                assert_eq!(severity, Severity::Warning);
                assert_eq!(text, "careful");
                assert_eq!(command, "gotoField");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
