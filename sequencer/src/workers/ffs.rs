//! Flat-field screen

use super::{time_limit, DeviceHandler, Handled};
use crate::config::secs_to_duration;
use crate::message::{Device, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;

pub struct FfsHandler;

#[async_trait]
impl DeviceHandler for FfsHandler {
    fn device(&self) -> Device {
        Device::Ffs
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let MessageKind::FfsMove { open } = msg.kind else {
            return Handled::Unhandled;
        };

        if ctx.bypass.get("ffs") {
            if let Some(cmd) = &msg.cmd {
                cmd.warn("Bypassing flat field screen");
            }
            return Handled::Reply(Ok(()));
        }

        let fallback = secs_to_duration(ctx.config.ffs_duration_secs + ctx.config.timeout_secs);
        let limit = time_limit(ctx, msg, fallback);
        ctx.ops.ffs_move(open, limit).await.into()
    }
}
