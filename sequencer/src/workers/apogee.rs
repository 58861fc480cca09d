//! APOGEE instrument and the scripts built on it

use super::{time_limit, DeviceHandler, Handled};
use crate::config::secs_to_duration;
use crate::device_ops::DeviceResult;
use crate::message::{Device, Exposure, ExposureType, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;

/// Readout slack on top of an APOGEE exposure time
const APOGEE_OVERHEAD_SECS: f64 = 30.0;

pub struct ApogeeHandler;

impl ApogeeHandler {
    async fn expose(&self, ctx: &SharedContext, msg: &Message, exposure: &Exposure) -> DeviceResult<()> {
        if let Some(dither) = exposure.dither {
            let current = ctx.status.snapshot().apogee_dither;
            if current != Some(dither) {
                ctx.ops
                    .apogee_dither(dither, secs_to_duration(ctx.config.apogee_dither_secs))
                    .await?;
            }
        }

        if let Some(cmd) = &msg.cmd {
            if exposure.exp_time > 0.0 {
                cmd.inform(format!("starting {}s {} exposure", exposure.exp_time, exposure.exp_type));
            } else {
                cmd.inform(format!("starting {} exposure", exposure.exp_type));
            }
        }
        let limit = secs_to_duration(exposure.exp_time + APOGEE_OVERHEAD_SECS);
        ctx.ops.apogee_expose(exposure, limit).await
    }
}

#[async_trait]
impl DeviceHandler for ApogeeHandler {
    fn device(&self) -> Device {
        Device::Apogee
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let result = match &msg.kind {
            MessageKind::Expose(exposure) => self.expose(ctx, msg, exposure).await,
            MessageKind::ApogeeShutter { open } => {
                ctx.ops
                    .apogee_shutter(*open, time_limit(ctx, msg, ctx.config.timeout()))
                    .await
            }
            MessageKind::StopExposure => ctx.ops.apogee_stop_exposure(ctx.config.timeout()).await,
            _ => return Handled::Unhandled,
        };
        result.into()
    }
}

/// Multi-step APOGEE scripts
pub struct ApogeeScriptHandler;

impl ApogeeScriptHandler {
    /// Shutter open, FF lamp on, one dome flat, FF lamp off
    ///
    /// The lamp goes off whatever happened before it.
    async fn dome_flat(&self, ctx: &SharedContext, msg: &Message) -> DeviceResult<()> {
        let timeout = ctx.config.timeout();
        let exposed = async {
            ctx.ops.apogee_shutter(true, timeout).await?;
            ctx.ops.lamp_switch(Device::FfLamp, true, timeout).await?;
            let exposure = Exposure::new(ExposureType::DomeFlat, ctx.config.apogee_dome_flat_secs);
            if let Some(cmd) = &msg.cmd {
                cmd.inform(format!("starting {}s dome flat", exposure.exp_time));
            }
            ctx.ops
                .apogee_expose(&exposure, secs_to_duration(exposure.exp_time + APOGEE_OVERHEAD_SECS))
                .await
        }
        .await;

        let lamp_off = ctx.ops.lamp_switch(Device::FfLamp, false, timeout).await;
        if let Err(e) = &lamp_off {
            tracing::warn!("failed to turn FF lamp off after dome flat: {}", e);
        }
        exposed.and(lamp_off)
    }
}

#[async_trait]
impl DeviceHandler for ApogeeScriptHandler {
    fn device(&self) -> Device {
        Device::ApogeeScript
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        match msg.kind {
            MessageKind::ApogeeDomeFlat => self.dome_flat(ctx, msg).await.into(),
            _ => Handled::Unhandled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::test_support::context;

    #[tokio::test]
    async fn test_dither_moved_only_when_different() {
        let (ctx, ops) = context();
        let handler = ApogeeHandler;
        for dither in ['A', 'B', 'B'] {
            let msg = Message::new(MessageKind::Expose(
                Exposure::new(ExposureType::Object, 10.0).with_dither(dither),
            ));
            assert!(matches!(handler.handle(&ctx, &msg).await, Handled::Reply(Ok(()))));
        }
        assert_eq!(ops.count_calls("apogee dither"), 1);
        assert_eq!(ops.count_calls("apogee expose"), 3);
        assert_eq!(ctx.status.snapshot().apogee_dither, Some('B'));
    }

    #[tokio::test]
    async fn test_dome_flat_turns_lamp_off_after_failure() {
        let (ctx, ops) = context();
        ops.fail_on("apogee expose");
        let msg = Message::new(MessageKind::ApogeeDomeFlat);
        assert!(matches!(
            ApogeeScriptHandler.handle(&ctx, &msg).await,
            Handled::Reply(Err(_))
        ));
        assert_eq!(
            ops.calls(),
            vec![
                "apogee shutter open".to_string(),
                "ff.on".to_string(),
                "apogee expose time=50 object=DomeFlat".to_string(),
                "ff.off".to_string(),
            ]
        );
    }
}
