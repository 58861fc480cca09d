//! Telescope control
//!
//! A slew is two messages on this worker's own queue: SLEW issues the track
//! command, then WAIT_FOR_SLEW_END polls the TCC status until the axes stop.
//! Between polls the worker goes back to its queue, so STATUS and EXIT are
//! still served while the telescope moves.

use super::{time_limit, DeviceHandler, Handled};
use crate::config::secs_to_duration;
use crate::message::{Device, Message, MessageKind, SlewTarget};
use crate::state::SharedContext;
use async_trait::async_trait;
use tokio::time::Instant;

pub struct TccHandler;

impl TccHandler {
    fn describe(target: &SlewTarget) -> String {
        match target {
            SlewTarget::Sky { ra, dec, rot, .. } => {
                format!("slewing to ({:.4}, {:.4}, {})", ra, dec, rot)
            }
            SlewTarget::Mount { az, alt, rot } => {
                format!("slewing to (az, alt, rot) == ({:.4}, {:.4}, {:.4})", az, alt, rot)
            }
        }
    }

    /// Queue the next poll of a slew in progress
    fn requeue(ctx: &SharedContext, msg: &Message, deadline: Instant) -> Handled {
        let mut wait = msg.clone();
        wait.kind = MessageKind::WaitForSlewEnd { deadline };
        match ctx.send(Device::Tcc, wait) {
            Ok(()) => Handled::Deferred,
            Err(e) => Handled::Reply(Err(format!("cannot wait for slew end: {}", e))),
        }
    }

    async fn start_slew(&self, ctx: &SharedContext, msg: &Message, target: &SlewTarget) -> Handled {
        let tcc = ctx.status.snapshot().tcc;
        if tcc.bad_stat && !ctx.bypass.get("axes") {
            let text = format!(
                "in slew with badStat={} halted={} slewing={}",
                tcc.bad_stat, tcc.halted, tcc.slewing
            );
            tracing::warn!("{}", text);
            if let Some(cmd) = &msg.cmd {
                cmd.warn(text);
            }
            return Handled::Reply(Err("some axis status is bad".to_string()));
        }

        if let Some(cmd) = &msg.cmd {
            cmd.inform(Self::describe(target));
            if matches!(target, SlewTarget::Sky { keep_offsets: true, .. }) {
                cmd.warn("keeping all offsets");
            }
        }

        let fallback = secs_to_duration(ctx.config.slew_timeout_secs + ctx.config.timeout_secs);
        let limit = time_limit(ctx, msg, fallback);
        if let Err(e) = ctx.ops.tcc_track(target, limit).await {
            if let Some(cmd) = &msg.cmd {
                cmd.warn("Failed to start slew");
            }
            return Handled::Reply(Err(e));
        }
        Self::requeue(ctx, msg, Instant::now() + limit)
    }

    async fn poll_slew(&self, ctx: &SharedContext, msg: &Message, deadline: Instant) -> Handled {
        let tcc = ctx.status.snapshot().tcc;
        if !tcc.slewing {
            return if tcc.halted {
                Handled::Reply(Err("telescope halted during slew".to_string()))
            } else {
                Handled::Reply(Ok(()))
            };
        }
        if Instant::now() >= deadline {
            return Handled::Reply(Err("timed out waiting for slew to end".to_string()));
        }
        tokio::time::sleep(ctx.config.slew_poll()).await;
        Self::requeue(ctx, msg, deadline)
    }
}

#[async_trait]
impl DeviceHandler for TccHandler {
    fn device(&self) -> Device {
        Device::Tcc
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        match &msg.kind {
            MessageKind::Slew(target) => self.start_slew(ctx, msg, target).await,
            MessageKind::WaitForSlewEnd { deadline } => self.poll_slew(ctx, msg, *deadline).await,
            _ => Handled::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Received};
    use crate::workers::spawn_worker;
    use crate::workers::test_support::context;
    use std::sync::Arc;
    use std::time::Duration;

    const TARGET: SlewTarget = SlewTarget::Sky {
        ra: 150.0,
        dec: 30.0,
        rot: 0.0,
        keep_offsets: false,
    };

    async fn slew(ctx: &SharedContext) -> Option<bool> {
        let reply = Arc::new(Channel::new("slew replies"));
        ctx.send(Device::Tcc, Message::new(MessageKind::Slew(TARGET)).reply_to(reply.clone()))
            .unwrap();
        match reply.receive(Duration::from_secs(5)).await {
            Received::Message(msg) => msg.kind.reply_success(),
            Received::TimedOut => None,
        }
    }

    #[tokio::test]
    async fn test_slew_waits_for_axes_to_stop() {
        let (ctx, ops) = context();
        let _worker = spawn_worker(&ctx, Device::Tcc).unwrap();
        assert_eq!(slew(&ctx).await, Some(true));
        assert_eq!(ops.count_calls("tcc track"), 1);
    }

    #[tokio::test]
    async fn test_bad_axis_status_refuses_slew_unless_bypassed() {
        let (ctx, ops) = context();
        ctx.status.update(|m| m.tcc.bad_stat = true);
        let _worker = spawn_worker(&ctx, Device::Tcc).unwrap();

        assert_eq!(slew(&ctx).await, Some(false));
        assert_eq!(ops.count_calls("tcc track"), 0);

        ctx.bypass.set("axes", true).unwrap();
        assert_eq!(slew(&ctx).await, Some(true));
    }

    #[tokio::test]
    async fn test_halted_slew_fails() {
        let (ctx, _ops) = context();
        ctx.status.update(|m| {
            m.tcc.slewing = true;
        });
        let handler = TccHandler;
        let deadline = Instant::now() + Duration::from_secs(5);
        let wait = Message::new(MessageKind::WaitForSlewEnd { deadline });

        // Still moving: polled again later
        assert!(matches!(handler.handle(&ctx, &wait).await, Handled::Deferred));
        assert_eq!(ctx.queue(Device::Tcc).unwrap().len(), 1);

        ctx.status.update(|m| {
            m.tcc.slewing = false;
            m.tcc.halted = true;
        });
        assert!(matches!(handler.handle(&ctx, &wait).await, Handled::Reply(Err(_))));
    }

    #[tokio::test]
    async fn test_slew_past_deadline_fails() {
        let (ctx, _ops) = context();
        ctx.status.update(|m| m.tcc.slewing = true);
        let wait = Message::new(MessageKind::WaitForSlewEnd {
            deadline: Instant::now() - Duration::from_millis(1),
        });
        assert!(matches!(TccHandler.handle(&ctx, &wait).await, Handled::Reply(Err(_))));
    }
}
