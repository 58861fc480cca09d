//! Device workers
//!
//! Every device gets one long-lived tokio task that drains its [`Channel`].
//! The loop itself is shared: heartbeats on idle, EXIT and STATUS handling,
//! panic containment and replies. What a device actually does with a
//! message is up to its [`DeviceHandler`].

mod apogee;
mod boss;
mod ffs;
mod guider;
mod lamp;
mod tcc;

pub use apogee::{ApogeeHandler, ApogeeScriptHandler};
pub use boss::BossHandler;
pub use ffs::FfsHandler;
pub use guider::GuiderHandler;
pub use lamp::LampHandler;
pub use tcc::TccHandler;

use crate::channel::{Channel, Received};
use crate::device_ops::DeviceResult;
use crate::event::SopEvent;
use crate::master::MasterHandler;
use crate::message::{Device, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What became of a message handed to a [`DeviceHandler`]
#[derive(Debug)]
pub enum Handled {
    /// Reply to the sender with this outcome
    Reply(DeviceResult<()>),
    /// The handler replied itself, or deferred the reply to a later message
    Deferred,
    /// Not a message this device understands; no reply is owed
    Unhandled,
}

impl From<DeviceResult<()>> for Handled {
    fn from(result: DeviceResult<()>) -> Self {
        Handled::Reply(result)
    }
}

/// Per-device behaviour plugged into the worker loop
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn device(&self) -> Device;

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled;

    /// Called after a panic escaped `handle`, once the failure reply is sent
    fn on_panic(&self, _ctx: &SharedContext, _msg: &Message, _reason: &str) {}
}

/// Handler for a device
pub fn handler_for(device: Device) -> Arc<dyn DeviceHandler> {
    match device {
        Device::Master => Arc::new(MasterHandler),
        Device::Ffs => Arc::new(FfsHandler),
        Device::FfLamp | Device::HgCdLamp | Device::NeLamp | Device::UvLamp | Device::WhtLamp => {
            Arc::new(LampHandler::new(device))
        }
        Device::Boss => Arc::new(BossHandler),
        Device::Guider => Arc::new(GuiderHandler),
        Device::Tcc => Arc::new(TccHandler),
        Device::Apogee => Arc::new(ApogeeHandler),
        Device::ApogeeScript => Arc::new(ApogeeScriptHandler),
    }
}

/// Send the reply owed for `msg`, if it asked for one
///
/// A refused send means the batch waiting for it is already over.
pub fn send_reply(msg: &Message, sender: Device, success: bool, detail: Option<String>) {
    let Some(reply_to) = &msg.reply_to else {
        return;
    };
    if let Err(e) = reply_to.send(msg.reply(sender, success, detail)) {
        tracing::debug!("{}: late reply to {} discarded: {}", sender, msg.kind, e);
    }
}

/// Time limit for a device call: the annotated duration plus the actor
/// timeout, or `fallback` when the message carries no duration
pub fn time_limit(ctx: &SharedContext, msg: &Message, fallback: Duration) -> Duration {
    match msg.duration {
        Some(duration) => duration + ctx.config.timeout(),
        None => fallback,
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// The worker loop; returns after EXIT
pub async fn run_worker(ctx: SharedContext, handler: Arc<dyn DeviceHandler>, queue: Arc<Channel>) {
    let device = handler.device();
    tracing::info!("Starting {} worker", device);

    loop {
        let msg = match queue.receive(ctx.config.timeout()).await {
            Received::Message(msg) => msg,
            Received::TimedOut => {
                tracing::debug!("{} alive", device);
                ctx.events.publish(SopEvent::Heartbeat {
                    worker: device.name().to_string(),
                });
                continue;
            }
        };

        match &msg.kind {
            MessageKind::Exit => {
                if let Some(cmd) = &msg.cmd {
                    cmd.inform(format!("Exiting thread {}", device));
                }
                tracing::info!("Exiting {} worker", device);
                return;
            }
            MessageKind::Status => {
                if let Some(cmd) = &msg.cmd {
                    cmd.inform(format!("{} thread", device));
                }
                send_reply(&msg, device, true, None);
                continue;
            }
            _ => {}
        }

        let outcome = AssertUnwindSafe(handler.handle(&ctx, &msg)).catch_unwind().await;
        match outcome {
            Ok(Handled::Reply(Ok(()))) => send_reply(&msg, device, true, None),
            Ok(Handled::Reply(Err(reason))) => {
                tracing::warn!("{}: {} failed: {}", device, msg.kind, reason);
                if let Some(cmd) = &msg.cmd {
                    cmd.warn(format!("{} {} failed: {}", device, msg.kind, reason));
                }
                send_reply(&msg, device, false, Some(reason));
            }
            Ok(Handled::Deferred) => {}
            Ok(Handled::Unhandled) => {
                let err = crate::error::SopError::UnhandledMessage {
                    device,
                    kind: msg.kind.name().to_string(),
                };
                tracing::error!("{}", err);
            }
            Err(payload) => {
                let reason = panic_message(&payload);
                tracing::error!("Unexpected panic in {} worker handling {}: {}", device, msg.kind, reason);
                send_reply(&msg, device, false, Some(format!("internal error: {}", reason)));
                handler.on_panic(&ctx, &msg, &reason);
            }
        }
    }
}

/// A running worker task
pub struct WorkerHandle {
    pub device: Device,
    pub join: JoinHandle<()>,
}

/// Spawn the worker for `device` on its current mailbox
pub fn spawn_worker(ctx: &SharedContext, device: Device) -> crate::error::SopResult<WorkerHandle> {
    let queue = ctx.queue(device)?;
    let join = tokio::spawn(run_worker(ctx.clone(), handler_for(device), queue));
    Ok(WorkerHandle { device, join })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::SopConfig;
    use crate::device_ops::SimulatedDeviceOps;
    use crate::event::EventBus;
    use crate::state::{SharedContext, SopContext};
    use crate::status::{Models, StatusModel};
    use std::sync::Arc;
    use tokio::time::Instant;

    /// Config with short timeouts for tests
    pub fn fast_config() -> SopConfig {
        let mut config = SopConfig::default();
        config.timeout_secs = 0.2;
        config.slew_poll_secs = 0.01;
        config.status_timeout_secs = 1.0;
        config.warmup.ff = 0.0;
        config.warmup.hgcd = 0.0;
        config.warmup.ne = 0.0;
        config
    }

    pub fn context() -> (SharedContext, Arc<SimulatedDeviceOps>) {
        let status = Arc::new(StatusModel::new(Models::quiescent(Instant::now())));
        let ops = Arc::new(SimulatedDeviceOps::new(status.clone()));
        let ctx = Arc::new(SopContext::new(fast_config(), status, ops.clone(), EventBus::default()));
        (ctx, ops)
    }

    /// Workers for every device but the master
    pub fn spawn_devices(ctx: &SharedContext) -> Vec<super::WorkerHandle> {
        crate::message::Device::ALL
            .iter()
            .filter(|d| **d != crate::message::Device::Master)
            .map(|d| super::spawn_worker(ctx, *d).unwrap())
            .collect()
    }

    /// Drain the receiver, keeping the text of command messages and completions
    pub fn messages(rx: &mut tokio::sync::broadcast::Receiver<crate::event::SopEvent>) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                crate::event::SopEvent::CommandMessage { text, .. }
                | crate::event::SopEvent::CommandFinished { text, .. } => texts.push(text),
                _ => {}
            }
        }
        texts
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::event::CommandHandle;

    async fn request(ctx: &SharedContext, device: Device, kind: MessageKind) -> Option<bool> {
        let reply = Arc::new(Channel::new("test replies"));
        ctx.send(device, Message::new(kind).reply_to(reply.clone())).unwrap();
        match reply.receive(Duration::from_secs(5)).await {
            Received::Message(msg) => msg.kind.reply_success(),
            Received::TimedOut => None,
        }
    }

    #[tokio::test]
    async fn test_status_and_exit() {
        let (ctx, _ops) = context();
        let worker = spawn_worker(&ctx, Device::Guider).unwrap();
        assert_eq!(request(&ctx, Device::Guider, MessageKind::Status).await, Some(true));

        let cmd = CommandHandle::new("restart", ctx.events.clone());
        ctx.send(Device::Guider, Message::new(MessageKind::Exit).for_command(Some(cmd)))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker.join)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_device_failure_is_replied() {
        let (ctx, ops) = context();
        ops.fail_on("ffs.close");
        let _worker = spawn_worker(&ctx, Device::Ffs).unwrap();
        assert_eq!(request(&ctx, Device::Ffs, MessageKind::FfsMove { open: false }).await, Some(false));
        assert_eq!(request(&ctx, Device::Ffs, MessageKind::FfsMove { open: true }).await, Some(true));
    }

    #[tokio::test]
    async fn test_unhandled_message_gets_no_reply_and_loop_continues() {
        let (ctx, _ops) = context();
        let _worker = spawn_worker(&ctx, Device::Ffs).unwrap();

        let reply = Arc::new(Channel::new("unhandled"));
        ctx.send(Device::Ffs, Message::new(MessageKind::GuiderStop).reply_to(reply.clone()))
            .unwrap();
        assert!(matches!(
            reply.receive(Duration::from_millis(100)).await,
            Received::TimedOut
        ));
        assert_eq!(request(&ctx, Device::Ffs, MessageKind::Status).await, Some(true));
    }

    #[tokio::test]
    async fn test_idle_worker_sends_heartbeats() {
        let (ctx, _ops) = context();
        let mut rx = ctx.events.subscribe();
        let _worker = spawn_worker(&ctx, Device::Boss).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SopEvent::Heartbeat { ref worker } if worker == "boss"));
    }
}
