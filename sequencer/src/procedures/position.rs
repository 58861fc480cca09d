//! Telescope moves: instrument change, stow and the APOGEE gang change

use super::apogee::run_dome_flat;
use super::{begin_stage, cleanup_after_failure, complete_stage, conclude_with, fail, report};
use crate::coordinator::MultiCommand;
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, MessageKind, NamedPosition, SlewTarget, Survey};
use crate::precondition::Precondition;
use crate::state::SopContext;

pub const INSTRUMENT_CHANGE_AZ: f64 = 121.0;
pub const INSTRUMENT_CHANGE_ALT: f64 = 90.0;
pub const STOW_ALT: f64 = 30.0;

/// Mount target of a named position, given the current az, alt, rot
pub fn position_target(position: NamedPosition, axe_pos: [f64; 3]) -> SlewTarget {
    match position {
        NamedPosition::InstrumentChange => SlewTarget::Mount {
            az: INSTRUMENT_CHANGE_AZ,
            alt: INSTRUMENT_CHANGE_ALT,
            rot: 0.0,
        },
        NamedPosition::Stow => SlewTarget::Mount {
            az: axe_pos[0],
            alt: STOW_ALT,
            rot: axe_pos[2],
        },
    }
}

/// Gang change target
///
/// With the gang at the cartridge the telescope heads for the instrument
/// change azimuth, moving the rotator toward zero only as far as it gets
/// while the altitude is moving (both axes at the same rate). Otherwise it
/// just nods in altitude.
pub fn gang_change_target(at_cartridge: bool, alt: f64, axe_pos: [f64; 3]) -> SlewTarget {
    let [this_az, this_alt, this_rot] = axe_pos;
    if !at_cartridge {
        return SlewTarget::Mount {
            az: this_az,
            alt,
            rot: this_rot,
        };
    }

    let mut rot = 0.0;
    let d_rot = rot - this_rot;
    if d_rot != 0.0 {
        let d_alt = alt - this_alt;
        let can_rot = d_rot * (d_alt.abs() / d_rot.abs()).min(1.0);
        rot = this_rot + can_rot;
    }
    SlewTarget::Mount {
        az: INSTRUMENT_CHANGE_AZ,
        alt,
        rot,
    }
}

pub async fn goto_position(ctx: &SopContext, cmd: &CommandHandle, position: NamedPosition) -> SopResult<()> {
    let state = match position {
        NamedPosition::InstrumentChange => ctx.commands.goto_instrument_change.clone(),
        NamedPosition::Stow => ctx.commands.goto_stow.clone(),
    };
    begin_stage(&*state, "slew")?;
    report(&*state);

    let target = position_target(position, ctx.status.snapshot().tcc.axe_pos);
    let mut batch = MultiCommand::new(
        ctx,
        Some(cmd.clone()),
        ctx.config.timeout_plus(ctx.config.position_slew_secs),
        "gotoPosition.slew",
    );
    batch.append(Device::Tcc, MessageKind::Slew(target));
    if !batch.run().await {
        let fail_text = format!("Failed to slew to {} position", position.label());
        return fail(&*state, cmd, Some("slew"), "failed to move telescope", &fail_text);
    }

    complete_stage(&*state, "slew")?;
    conclude_with(
        &*state,
        cmd,
        &format!("at {} position", position.label()),
        Some("moved telescope"),
    );
    Ok(())
}

pub async fn goto_gang_change(ctx: &SopContext, cmd: &CommandHandle, alt: f64, survey: Survey) -> SopResult<()> {
    let state = ctx.commands.goto_gang_change.clone();
    begin_stage(&*state, "slew")?;
    report(&*state);

    let models = ctx.status.snapshot();
    let at_cartridge = models.gang_at_cartridge(&ctx.bypass);
    if at_cartridge && survey != Survey::Boss {
        cmd.warn(format!("scheduling cals: {} {}", at_cartridge, survey));
        if !run_dome_flat(ctx, cmd, "gotoGangChange.domeFlat").await {
            cleanup_after_failure(ctx, cmd, false, "gotoGangChange").await;
            return fail(
                &*state,
                cmd,
                Some("slew"),
                "failed to take cals",
                "Failed to take cals going before gang change",
            );
        }
    } else {
        cmd.warn(format!("skipping cals: {} {}", at_cartridge, survey));
    }

    // the dome flat does not move the telescope
    let target = gang_change_target(at_cartridge, alt, models.tcc.axe_pos);
    if let SlewTarget::Mount { az, alt, rot } = target {
        cmd.warn(format!("might slew to {:.1},{:.1},{:.1}", az, alt, rot));
    }
    let mut batch = MultiCommand::new(
        ctx,
        Some(cmd.clone()),
        ctx.config.timeout_plus(ctx.config.gang_change_slew_secs),
        "gotoGangChange.slew",
    );
    if survey != Survey::Boss {
        batch.append_precondition(Precondition::apogee_shutter(false));
    }
    batch.append(Device::Tcc, MessageKind::Slew(target));
    if !batch.run().await {
        return fail(
            &*state,
            cmd,
            Some("slew"),
            "failed to move telescope",
            "Failed to slew to gang change",
        );
    }

    complete_stage(&*state, "slew")?;
    conclude_with(&*state, cmd, "at gang change position", Some("moved telescope"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_state::{read_cmd, write_cmd, CommandStatus, SopCommand, StageState};
    use crate::status::GangPosition;
    use crate::workers::test_support::{context, spawn_devices};

    #[test]
    fn test_rotator_moves_as_far_as_altitude_allows() {
        assert_eq!(
            gang_change_target(true, 45.0, [100.0, 80.0, 60.0]),
            SlewTarget::Mount { az: 121.0, alt: 45.0, rot: 25.0 }
        );
        // altitude move longer than the rotator move: rotator reaches zero
        assert_eq!(
            gang_change_target(true, 45.0, [100.0, 90.0, 10.0]),
            SlewTarget::Mount { az: 121.0, alt: 45.0, rot: 0.0 }
        );
        assert_eq!(
            gang_change_target(false, 45.0, [100.0, 80.0, 60.0]),
            SlewTarget::Mount { az: 100.0, alt: 45.0, rot: 60.0 }
        );
    }

    #[test]
    fn test_named_positions() {
        let here = [200.0, 60.0, -30.0];
        assert_eq!(
            position_target(NamedPosition::InstrumentChange, here),
            SlewTarget::Mount { az: 121.0, alt: 90.0, rot: 0.0 }
        );
        assert_eq!(
            position_target(NamedPosition::Stow, here),
            SlewTarget::Mount { az: 200.0, alt: 30.0, rot: -30.0 }
        );
    }

    #[tokio::test]
    async fn test_stow() {
        let (ctx, ops) = context();
        let _workers = spawn_devices(&ctx);
        let cmd = CommandHandle::new("gotoStow", ctx.events.clone());
        write_cmd(&ctx.commands.goto_stow)
            .core_mut()
            .setup_command(cmd.clone(), &["slew"])
            .unwrap();

        goto_position(&ctx, &cmd, NamedPosition::Stow).await.unwrap();

        assert_eq!(ops.count_calls("tcc track 121, 30 mount/rottype=mount/rotangle=0"), 1);
        let stow = read_cmd(&ctx.commands.goto_stow);
        assert_eq!(stow.core().status(), CommandStatus::Done);
        assert_eq!(stow.core().state_text(), "moved telescope");
        assert_eq!(stow.core().stage("slew"), Some(StageState::Done));
    }

    #[tokio::test]
    async fn test_gang_change_at_cartridge_takes_dome_flat() {
        let (ctx, ops) = context();
        ctx.status.update(|m| {
            m.gang = GangPosition::Cartridge;
            m.tcc.axe_pos = [100.0, 80.0, 60.0];
        });
        let _workers = spawn_devices(&ctx);
        let cmd = CommandHandle::new("gotoGangChange", ctx.events.clone());
        write_cmd(&ctx.commands.goto_gang_change)
            .core_mut()
            .setup_command(cmd.clone(), &["slew"])
            .unwrap();

        goto_gang_change(&ctx, &cmd, 45.0, Survey::Apogee).await.unwrap();

        let calls = ops.calls();
        let flat = calls
            .iter()
            .position(|c| c == "apogee expose time=50 object=DomeFlat")
            .unwrap();
        let close = calls.iter().position(|c| c == "apogee shutter close").unwrap();
        assert!(flat < close);
        assert!(calls.contains(&"tcc track 121, 45 mount/rottype=mount/rotangle=25".to_string()));
        assert_eq!(
            read_cmd(&ctx.commands.goto_gang_change).core().status(),
            CommandStatus::Done
        );
    }

    #[tokio::test]
    async fn test_gang_change_boss_plate_nods() {
        let (ctx, ops) = context();
        let _workers = spawn_devices(&ctx);
        let cmd = CommandHandle::new("gotoGangChange", ctx.events.clone());
        write_cmd(&ctx.commands.goto_gang_change)
            .core_mut()
            .setup_command(cmd.clone(), &["slew"])
            .unwrap();

        goto_gang_change(&ctx, &cmd, 45.0, Survey::Boss).await.unwrap();

        assert_eq!(ops.count_calls("apogee"), 0);
        assert_eq!(ops.count_calls("tcc track 121, 45 mount/rottype=mount/rotangle=0"), 1);
    }
}
