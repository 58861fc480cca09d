//! BOSS spectrograph cameras

use super::{time_limit, DeviceHandler, Handled};
use crate::coordinator::expected_duration;
use crate::message::{Device, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;

pub struct BossHandler;

#[async_trait]
impl DeviceHandler for BossHandler {
    fn device(&self) -> Device {
        Device::Boss
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let fallback = expected_duration(&ctx.config, Device::Boss, &msg.kind)
            .map(|d| d + ctx.config.timeout())
            .unwrap_or_else(|| ctx.config.timeout());
        let limit = time_limit(ctx, msg, fallback);

        let result = match &msg.kind {
            MessageKind::Expose(exposure) => {
                if let Some(cmd) = &msg.cmd {
                    if exposure.is_readout_only() {
                        cmd.inform("reading out pending exposure");
                    } else {
                        cmd.inform(format!(
                            "starting {}s {} exposure",
                            exposure.exp_time, exposure.exp_type
                        ));
                    }
                }
                ctx.ops.boss_expose(exposure, limit).await
            }
            MessageKind::Hartmann => ctx.ops.boss_hartmann(limit).await,
            MessageKind::MoveCollimator { spectrograph, a, b, c } => {
                ctx.ops
                    .boss_move_collimator(*spectrograph, *a, *b, *c, ctx.config.timeout())
                    .await
            }
            MessageKind::StopExposure => ctx.ops.boss_stop_exposure(ctx.config.timeout()).await,
            _ => return Handled::Unhandled,
        };
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Exposure, ExposureType, Spectrograph};
    use crate::workers::test_support::context;

    #[tokio::test]
    async fn test_boss_operations() {
        let (ctx, ops) = context();
        let handler = BossHandler;
        let arc = Message::new(MessageKind::Expose(
            Exposure::new(ExposureType::Arc, 4.0).without_readout(),
        ));
        assert!(matches!(handler.handle(&ctx, &arc).await, Handled::Reply(Ok(()))));
        let coll = Message::new(MessageKind::MoveCollimator {
            spectrograph: Spectrograph::Sp2,
            a: 10,
            b: 10,
            c: -10,
        });
        assert!(matches!(handler.handle(&ctx, &coll).await, Handled::Reply(Ok(()))));
        assert_eq!(
            ops.calls(),
            vec![
                "boss exposure arc itime=4 noreadout".to_string(),
                "boss moveColl spec=sp2 a=10 b=10 c=-10".to_string(),
            ]
        );
    }
}
