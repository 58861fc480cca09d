//! The master task
//!
//! Runs the sequencing procedures strictly one at a time, in the order their
//! messages arrive. A procedure that returns `Err` has hit a programming
//! error (an undeclared stage, say); the master marks the command state
//! failed, fails the user command and keeps serving its mailbox.

use crate::cmd_state::{CommandStatus, SopCommand};
use crate::device_ops::DeviceResult;
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Message, MessageKind, NamedPosition};
use crate::procedures;
use crate::state::SharedContext;
use crate::workers::{DeviceHandler, Handled};
use async_trait::async_trait;

pub struct MasterHandler;

/// Command state a master message drives, if it has one
fn state_name(kind: &MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::DoCalibs { .. } => Some("doCalibs"),
        MessageKind::DoScience => Some("doScience"),
        MessageKind::DoApogeeExposures { sky_flats: false, .. } => Some("doApogeeScience"),
        MessageKind::DoApogeeExposures { sky_flats: true, .. } => Some("doApogeeSkyFlats"),
        MessageKind::DoApogeeDomeFlat => Some("doApogeeDomeFlat"),
        MessageKind::GotoField { .. } => Some("gotoField"),
        MessageKind::GotoGangChange { .. } => Some("gotoGangChange"),
        MessageKind::GotoPosition(NamedPosition::InstrumentChange) => Some("gotoInstrumentChange"),
        MessageKind::GotoPosition(NamedPosition::Stow) => Some("gotoStow"),
        _ => None,
    }
}

fn fail_state(ctx: &SharedContext, kind: &MessageKind, reason: &str) {
    if let Some(name) = state_name(kind) {
        ctx.commands
            .with_command(name, |state| state.set_command_state(CommandStatus::Failed, Some(reason)));
    }
}

impl MasterHandler {
    async fn dispatch(&self, ctx: &SharedContext, cmd: &CommandHandle, kind: &MessageKind) -> Option<SopResult<()>> {
        let result = match kind {
            MessageKind::DoCalibs { survey, cartridge } => {
                procedures::do_calibs(ctx, cmd, *survey, *cartridge).await
            }
            MessageKind::DoScience => procedures::do_science(ctx, cmd).await,
            MessageKind::DoApogeeExposures { exp_type, sky_flats } => {
                procedures::do_apogee_exposures(ctx, cmd, *exp_type, *sky_flats).await
            }
            MessageKind::DoApogeeDomeFlat => procedures::do_apogee_dome_flat(ctx, cmd).await,
            MessageKind::GotoField { survey } => procedures::goto_field(ctx, cmd, *survey).await,
            MessageKind::GotoGangChange { alt, survey } => {
                procedures::goto_gang_change(ctx, cmd, *alt, *survey).await
            }
            MessageKind::GotoPosition(position) => procedures::goto_position(ctx, cmd, *position).await,
            MessageKind::DoHartmann { exp_time, spectrographs } => {
                procedures::hartmann(ctx, cmd, *exp_time, spectrographs).await;
                Ok(())
            }
            MessageKind::DitheredFlat {
                exp_time,
                spectrographs,
                n_step,
                n_tick,
            } => {
                procedures::dithered_flat(ctx, cmd, *exp_time, spectrographs, *n_step, *n_tick).await;
                Ok(())
            }
            _ => return None,
        };
        Some(result)
    }
}

#[async_trait]
impl DeviceHandler for MasterHandler {
    fn device(&self) -> Device {
        Device::Master
    }

    async fn handle(&self, ctx: &SharedContext, msg: &Message) -> Handled {
        let Some(cmd) = &msg.cmd else {
            tracing::error!("master: {} arrived without a user command", msg.kind);
            let reply: DeviceResult<()> = Err(format!("{} needs a user command", msg.kind));
            return Handled::Reply(reply);
        };

        // End of a hartmann or dithered flat sequence
        if let MessageKind::ExposureFinished { success } = msg.kind {
            if success {
                cmd.finish("");
            } else {
                cmd.fail("");
            }
            return Handled::Deferred;
        }

        tracing::info!("master: starting {} for {}", msg.kind, cmd.name());
        match self.dispatch(ctx, cmd, &msg.kind).await {
            None => Handled::Unhandled,
            Some(Ok(())) => Handled::Deferred,
            Some(Err(e)) => {
                let reason = e.to_string();
                tracing::error!("master: {} failed: {}", msg.kind, reason);
                fail_state(ctx, &msg.kind, &reason);
                cmd.fail(reason.clone());
                Handled::Reply(Err(reason))
            }
        }
    }

    fn on_panic(&self, ctx: &SharedContext, msg: &Message, reason: &str) {
        fail_state(ctx, &msg.kind, reason);
        if let Some(cmd) = &msg.cmd {
            cmd.fail(format!("{} crashed: {}", msg.kind, reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_state::{read_cmd, write_cmd, ExposureCount};
    use crate::event::SopEvent;
    use crate::message::Survey;
    use crate::workers::spawn_worker;
    use crate::workers::test_support::{context, spawn_devices};
    use std::time::Duration;

    async fn finished(rx: &mut tokio::sync::broadcast::Receiver<SopEvent>) -> (bool, String) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SopEvent::CommandFinished { success, text, .. } = event {
                return (success, text);
            }
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(
            state_name(&MessageKind::DoApogeeExposures {
                exp_type: crate::message::ExposureType::Object,
                sky_flats: true
            }),
            Some("doApogeeSkyFlats")
        );
        assert_eq!(
            state_name(&MessageKind::GotoPosition(NamedPosition::Stow)),
            Some("gotoStow")
        );
        assert_eq!(
            state_name(&MessageKind::DoHartmann {
                exp_time: 4.0,
                spectrographs: vec![]
            }),
            None
        );
    }

    #[tokio::test]
    async fn test_master_runs_science() {
        let (ctx, ops) = context();
        let _devices = spawn_devices(&ctx);
        let _master = spawn_worker(&ctx, Device::Master).unwrap();
        let mut rx = ctx.events.subscribe();

        let cmd = CommandHandle::new("doScience", ctx.events.clone());
        {
            let mut science = write_cmd(&ctx.commands.do_science);
            science.n_exp = ExposureCount::new(1);
            science.exp_time = 1.0;
            science.core_mut().setup_command(cmd.clone(), &["expose"]).unwrap();
        }
        ctx.send(Device::Master, Message::new(MessageKind::DoScience).for_command(Some(cmd)))
            .unwrap();

        let (success, _) = finished(&mut rx).await;
        assert!(success);
        assert_eq!(ops.count_calls("boss exposure science"), 1);
        assert_eq!(read_cmd(&ctx.commands.do_science).core().status(), CommandStatus::Done);
    }

    #[tokio::test]
    async fn test_procedure_error_fails_state_and_command() {
        let (ctx, _ops) = context();
        let _master = spawn_worker(&ctx, Device::Master).unwrap();
        let mut rx = ctx.events.subscribe();

        // A stage list without "bias" makes the procedure trip over it
        let cmd = CommandHandle::new("doCalibs", ctx.events.clone());
        {
            let mut calibs = write_cmd(&ctx.commands.do_calibs);
            calibs.n_bias = ExposureCount::new(1);
            calibs.core_mut().set_stages(&["cleanup"]);
            calibs.core_mut().setup_command(cmd.clone(), &["cleanup"]).unwrap();
        }
        ctx.send(
            Device::Master,
            Message::new(MessageKind::DoCalibs {
                survey: Survey::Boss,
                cartridge: 11,
            })
            .for_command(Some(cmd)),
        )
        .unwrap();

        let (success, text) = finished(&mut rx).await;
        assert!(!success);
        assert!(text.contains("no stage named 'bias'"), "{}", text);
        assert_eq!(read_cmd(&ctx.commands.do_calibs).core().status(), CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_exposure_finished_ends_command() {
        let (ctx, _ops) = context();
        let _master = spawn_worker(&ctx, Device::Master).unwrap();
        let mut rx = ctx.events.subscribe();

        let cmd = CommandHandle::new("hartmann", ctx.events.clone());
        ctx.send(
            Device::Master,
            Message::new(MessageKind::ExposureFinished { success: false }).for_command(Some(cmd.clone())),
        )
        .unwrap();
        let (success, _) = finished(&mut rx).await;
        assert!(!success);
        assert!(!cmd.is_alive());
    }
}
