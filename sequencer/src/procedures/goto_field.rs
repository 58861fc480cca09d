//! gotoField: slew to a plate, calibrate it and start guiding
//!
//! The last flat is read out while the telescope gets ready to guide; its
//! batch is started without waiting and collected at the very end.

use super::{begin_stage, cleanup_after_failure, complete_stage, conclude, fail, lamp_preconditions, report};
use crate::cmd_state::{read_cmd, write_cmd, GotoFieldCmd};
use crate::config::secs_to_duration;
use crate::coordinator::{MultiCommand, PendingBatch};
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, MessageKind, SlewTarget, Survey};
use crate::precondition::Precondition;
use crate::state::SopContext;
use std::sync::RwLock as StdRwLock;

/// Where the slew goes: the plate, or the fake position when slewing to the
/// field is bypassed
fn slew_target(ctx: &SopContext, field: &GotoFieldCmd, cmd: &CommandHandle) -> SlewTarget {
    if ctx.bypass.get("slewToField") {
        let [az, alt, rot] = ctx.status.snapshot().tcc.axe_pos;
        let target = SlewTarget::Mount {
            az: field.fake_az.unwrap_or(az),
            alt: field.fake_alt.unwrap_or(alt),
            rot: rot + field.fake_rot_offset,
        };
        if let SlewTarget::Mount { az, alt, rot } = target {
            cmd.warn(format!("FAKING a slew to az={} alt={} rot={}", az, alt, rot));
        }
        return target;
    }
    SlewTarget::Sky {
        ra: field.ra,
        dec: field.dec,
        rot: field.rotang,
        keep_offsets: field.keep_offsets,
    }
}

const FLAT_OVERHEAD_SECS: f64 = 30.0;

fn switch(on: bool) -> MessageKind {
    MessageKind::LampOn { on, delay: None }
}

/// Give up: collect the outstanding readout, clean up, fail everything
#[allow(clippy::too_many_arguments)]
async fn abandon(
    ctx: &SopContext,
    state: &StdRwLock<GotoFieldCmd>,
    cmd: &CommandHandle,
    stage: Option<&str>,
    readout: Option<PendingBatch>,
    pending_readout: bool,
    state_text: &str,
    fail_text: &str,
) -> SopResult<()> {
    if let Some(readout) = readout {
        if !readout.finish().await {
            cmd.warn("Failed to readout last exposure");
        }
    }
    cleanup_after_failure(ctx, cmd, pending_readout, "gotoField").await;
    fail(state, cmd, stage, state_text, fail_text)
}

pub async fn goto_field(ctx: &SopContext, cmd: &CommandHandle, survey: Survey) -> SopResult<()> {
    let state = ctx.commands.goto_field.clone();
    let state = &*state;
    let config = &ctx.config;
    report(state);

    let mut do_guider_flat = read_cmd(state).do_guider_flat;

    // Slew
    let (target, arcs_or_hartmann, needs_screen) = {
        let field = read_cmd(state);
        let arcs_or_hartmann = field.n_arc.left > 0 || field.do_hartmann;
        let needs_screen = arcs_or_hartmann || field.n_flat.left > 0 || do_guider_flat;
        let target = field.do_slew.then(|| slew_target(ctx, &field, cmd));
        (target, arcs_or_hartmann, needs_screen)
    };
    if let Some(target) = target {
        begin_stage(state, "slew")?;
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            config.timeout_plus(config.slew_timeout_secs),
            "gotoField.slew",
        );
        batch.append(Device::Tcc, MessageKind::Slew(target));
        if needs_screen {
            batch.append(Device::Ffs, MessageKind::FfsMove { open: false });
        }
        if arcs_or_hartmann {
            batch
                .append(Device::HgCdLamp, switch(true))
                .append(Device::NeLamp, switch(true))
                .append(Device::WhtLamp, switch(false))
                .append(Device::UvLamp, switch(false));
        } else if do_guider_flat && survey == Survey::Apogee {
            batch.append(Device::FfLamp, switch(true));
        }

        if !batch.run().await {
            let tcc = ctx.status.snapshot().tcc;
            let state_text = if tcc.bad_stat && !ctx.bypass.get("axes") {
                cmd.warn("Some axis status is bad!!! Cannot slew!");
                "Some axis status is bad!"
            } else {
                "failed to slew"
            };
            return abandon(
                ctx,
                state,
                cmd,
                Some("slew"),
                None,
                false,
                state_text,
                "Failed to close screens, warm up lamps, and slew to field",
            )
            .await;
        }

        // Without calibrations the guider flat belongs to the slew
        if do_guider_flat && survey == Survey::Apogee {
            let guider_flat_time = read_cmd(state).guider_flat_time;
            let mut batch = MultiCommand::new(
                ctx,
                Some(cmd.clone()),
                config.timeout_plus(config.guider_delay_secs),
                "gotoField.slew.guiderFlat",
            );
            cmd.inform("commanding guider flat");
            batch
                .append_precondition(Precondition::lamp(Device::FfLamp, true))
                .append_precondition(Precondition::ffs(false))
                .append(
                    Device::Guider,
                    MessageKind::Expose(Exposure::new(ExposureType::Flat, guider_flat_time)),
                );
            do_guider_flat = false;
            if !batch.run().await {
                return abandon(
                    ctx,
                    state,
                    cmd,
                    Some("slew"),
                    None,
                    false,
                    "failed to take guider flat",
                    "Failed to take a guider flat",
                )
                .await;
            }
        }
        complete_stage(state, "slew")?;
        report(state);
    }

    // Hartmann
    if read_cmd(state).do_hartmann {
        begin_stage(state, "hartmann")?;
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            config.timeout_plus(config.hartmann_delay_secs),
            "gotoField.hartmann",
        );
        batch
            .append_with_timeout(
                Device::Boss,
                MessageKind::Hartmann,
                config.timeout_plus(config.hartmann_duration_secs),
            )
            .append_precondition(Precondition::lamp(Device::FfLamp, false))
            // no warm-up wait on HgCd; Ne sets the pace
            .append(Device::HgCdLamp, switch(true))
            .append_precondition(Precondition::lamp(Device::NeLamp, true))
            .append_precondition(Precondition::lamp(Device::WhtLamp, false))
            .append_precondition(Precondition::lamp(Device::UvLamp, false))
            .append_precondition(Precondition::ffs(false));
        if !batch.run().await {
            return abandon(
                ctx,
                state,
                cmd,
                Some("hartmann"),
                None,
                false,
                "failed to take hartmann sequence",
                "Failed to do Hartmann sequence",
            )
            .await;
        }
        complete_stage(state, "hartmann")?;
        report(state);
    }

    // Calibrations, arcs first
    let mut pending_readout = false;
    let doing_calibs = {
        let field = read_cmd(state);
        (field.n_arc.left > 0 || field.n_flat.left > 0) && field.n_arc.done == 0 && field.n_flat.done == 0
    };
    if doing_calibs {
        begin_stage(state, "calibs")?;
    }

    if read_cmd(state).n_arc.left > 0 {
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            config.timeout_plus(config.warmup.hgcd),
            "gotoField.calibs.arcs",
        );
        batch.append_precondition(Precondition::ffs(false));
        lamp_preconditions(&mut batch, &[Device::HgCdLamp, Device::NeLamp]);
        if !batch.run().await {
            return abandon(
                ctx,
                state,
                cmd,
                Some("calibs"),
                None,
                false,
                "failed to prepare for arcs",
                "Failed to prepare for arcs",
            )
            .await;
        }

        // An abort may have arrived during the warm-up
        let (left, arc_time) = {
            let field = read_cmd(state);
            (field.n_arc.left, field.arc_time)
        };
        if left > 0 {
            let mut batch = MultiCommand::new(
                ctx,
                Some(cmd.clone()),
                secs_to_duration(config.flush_duration_secs + arc_time + config.timeout_secs),
                "gotoField.calibs.arcExposure",
            );
            batch.append(
                Device::Boss,
                MessageKind::Expose(Exposure::new(ExposureType::Arc, arc_time).without_readout()),
            );
            if !batch.run().await {
                return abandon(
                    ctx,
                    state,
                    cmd,
                    Some("calibs"),
                    None,
                    true,
                    "failed to take arcs",
                    "Failed to take arcs",
                )
                .await;
            }
            pending_readout = true;
            write_cmd(state).n_arc.record_done();
            report(state);
        }
    }

    // Flats
    let (flats_left, flat_time, do_guider, guider_flat_time) = {
        let field = read_cmd(state);
        (field.n_flat.left, field.flat_time, field.do_guider, field.guider_flat_time)
    };
    do_guider_flat = do_guider_flat && do_guider && guider_flat_time > 0.0;

    let mut timeout = config.timeout_plus(config.ffs_duration_secs);
    if pending_readout {
        timeout += config.readout_duration();
    }
    let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, "gotoField.calibs.flats");
    if pending_readout {
        batch.append(Device::Boss, MessageKind::Expose(Exposure::pending_readout()));
        pending_readout = false;
    }
    if flats_left > 0 || do_guider_flat {
        batch.append_precondition(Precondition::ffs(false));
        lamp_preconditions(&mut batch, &[Device::FfLamp]);
    }
    if !batch.run().await {
        return abandon(
            ctx,
            state,
            cmd,
            Some("calibs"),
            None,
            false,
            "failed to prepare flats",
            "Failed to prepare for flats",
        )
        .await;
    }

    if flats_left > 0 || do_guider_flat {
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            secs_to_duration(
                config.flush_duration_secs + flat_time + config.timeout_secs + FLAT_OVERHEAD_SECS,
            ),
            "gotoField.calibs.flatExposure",
        );
        if flats_left > 0 {
            pending_readout = true;
            batch.append(
                Device::Boss,
                MessageKind::Expose(Exposure::new(ExposureType::Flat, flat_time).without_readout()),
            );
        }
        if do_guider_flat {
            batch.append(
                Device::Guider,
                MessageKind::Expose(Exposure::new(ExposureType::Flat, guider_flat_time)),
            );
        }
        if !batch.run().await {
            return abandon(
                ctx,
                state,
                cmd,
                Some("calibs"),
                None,
                pending_readout,
                "failed to take flats",
                "Failed to take flats",
            )
            .await;
        }
        if flats_left > 0 {
            write_cmd(state).n_flat.record_done();
        }
        report(state);
    }

    // Read out the last flat while getting ready to guide
    let readout = if pending_readout {
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            config.timeout() + config.readout_duration(),
            "gotoField.calibs.lastFlatReadout",
        );
        batch.append(Device::Boss, MessageKind::Expose(Exposure::pending_readout()));
        Some(batch.start())
    } else {
        if doing_calibs {
            complete_stage(state, "calibs")?;
        }
        None
    };

    let do_guider = read_cmd(state).do_guider;
    let mut batch = MultiCommand::new(
        ctx,
        Some(cmd.clone()),
        config.timeout_plus(config.ffs_duration_secs),
        "gotoField.guide.prep",
    );
    lamp_preconditions(&mut batch, &[]);
    if do_guider {
        batch.append(Device::Ffs, MessageKind::FfsMove { open: true });
    }
    if !batch.run().await {
        return abandon(
            ctx,
            state,
            cmd,
            None,
            readout,
            false,
            "failed to prepare to guide",
            "Failed to prepare to guide",
        )
        .await;
    }

    if do_guider {
        begin_stage(state, "guider")?;
        let guider_time = read_cmd(state).guider_time;
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            config.timeout_plus(guider_time),
            "gotoField.guide.start",
        );
        batch
            .append(
                Device::Guider,
                MessageKind::GuiderStart {
                    exp_time: guider_time,
                    clear_corrections: true,
                },
            )
            .append_precondition(Precondition::ffs(true));
        lamp_preconditions(&mut batch, &[]);
        if !batch.run().await {
            return abandon(
                ctx,
                state,
                cmd,
                Some("guider"),
                readout,
                false,
                "failed to start the guider",
                "Failed to start guiding",
            )
            .await;
        }
        complete_stage(state, "guider")?;
        report(state);
    }

    if let Some(readout) = readout {
        if !readout.finish().await {
            return fail(
                state,
                cmd,
                Some("calibs"),
                "failed to readout last exposure",
                "Failed to readout last exposure",
            );
        }
        complete_stage(state, "calibs")?;
    }

    conclude(state, cmd, "on field");
    Ok(())
}
