//! Guide camera

use super::{time_limit, DeviceHandler, Handled};
use crate::config::secs_to_duration;
use crate::message::{Device, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;

/// Slack given to guider commands on top of their exposure time
const GUIDER_OVERHEAD_SECS: f64 = 100.0;

pub struct GuiderHandler;

#[async_trait]
impl DeviceHandler for GuiderHandler {
    fn device(&self) -> Device {
        Device::Guider
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let result = match &msg.kind {
            MessageKind::GuiderStart { exp_time, clear_corrections } => {
                if let Some(cmd) = &msg.cmd {
                    cmd.inform("starting guider");
                }
                let limit = secs_to_duration(exp_time + GUIDER_OVERHEAD_SECS);
                ctx.ops.guider_start(*exp_time, *clear_corrections, limit).await
            }
            MessageKind::GuiderStop => {
                if let Some(cmd) = &msg.cmd {
                    cmd.inform("stopping guider");
                }
                ctx.ops.guider_stop(ctx.config.timeout()).await
            }
            MessageKind::Expose(exposure) => {
                if let Some(cmd) = &msg.cmd {
                    cmd.inform("starting guider flat");
                }
                let fallback = secs_to_duration(exposure.exp_time + GUIDER_OVERHEAD_SECS);
                ctx.ops
                    .guider_flat(exposure.exp_time, time_limit(ctx, msg, fallback))
                    .await
            }
            _ => return Handled::Unhandled,
        };
        result.into()
    }
}
