//! Calibration lamp banks

use super::{time_limit, DeviceHandler, Handled};
use crate::message::{Device, Message, MessageKind};
use crate::state::SharedContext;
use async_trait::async_trait;

pub struct LampHandler {
    device: Device,
}

impl LampHandler {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Bypass flag that makes the lamp pretend to obey
    fn bypass_name(&self) -> Option<&'static str> {
        match self.device {
            Device::FfLamp => Some("ff_lamp"),
            Device::HgCdLamp => Some("hgcd_lamp"),
            Device::NeLamp => Some("ne_lamp"),
            _ => None,
        }
    }
}

#[async_trait]
impl DeviceHandler for LampHandler {
    fn device(&self) -> Device {
        self.device
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let MessageKind::LampOn { on, delay } = &msg.kind else {
            return Handled::Unhandled;
        };

        if self.bypass_name().map_or(false, |name| ctx.bypass.get(name)) {
            if let Some(cmd) = &msg.cmd {
                cmd.warn(format!("Bypassing {} lamp", self.device));
            }
            return Handled::Reply(Ok(()));
        }

        let limit = time_limit(ctx, msg, ctx.config.timeout());
        if let Err(e) = ctx.ops.lamp_switch(self.device, *on, limit).await {
            return Handled::Reply(Err(e));
        }

        if let Some(delay) = delay.filter(|d| *on && !d.is_zero()) {
            if let Some(cmd) = &msg.cmd {
                cmd.inform(format!(
                    "Waiting {}s for {} lamps to warm up",
                    delay.as_secs(),
                    self.device
                ));
            }
            tokio::time::sleep(delay).await;
        }
        Handled::Reply(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::test_support::context;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_warmup_delay_is_waited_out() {
        let (ctx, ops) = context();
        let handler = LampHandler::new(Device::HgCdLamp);
        let msg = Message::new(MessageKind::LampOn {
            on: true,
            delay: Some(Duration::from_millis(50)),
        });

        let started = Instant::now();
        assert!(matches!(handler.handle(&ctx, &msg).await, Handled::Reply(Ok(()))));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(ops.calls(), vec!["hgcd.on".to_string()]);
    }

    #[tokio::test]
    async fn test_bypassed_lamp_is_not_switched() {
        let (ctx, ops) = context();
        ctx.bypass.set("ff_lamp", true).unwrap();
        let handler = LampHandler::new(Device::FfLamp);
        let msg = Message::new(MessageKind::LampOn { on: true, delay: None });
        assert!(matches!(handler.handle(&ctx, &msg).await, Handled::Reply(Ok(()))));
        assert!(ops.calls().is_empty());
    }

    #[tokio::test]
    async fn test_other_kinds_unhandled() {
        let (ctx, _ops) = context();
        let handler = LampHandler::new(Device::NeLamp);
        let msg = Message::new(MessageKind::FfsMove { open: true });
        assert!(matches!(handler.handle(&ctx, &msg).await, Handled::Unhandled));
    }
}
