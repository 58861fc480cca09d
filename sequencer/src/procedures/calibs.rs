//! doCalibs: biases, darks, flats and arcs with the BOSS spectrographs
//!
//! Flats and arcs are taken without readout so that the lamps and screen can
//! be set up for the next exposure while the previous one reads out.

use super::{begin_stage, cleanup_after_failure, complete_stage, conclude, fail, report};
use crate::cmd_state::{read_cmd, write_cmd, DoCalibsCmd, ExposureCount};
use crate::coordinator::MultiCommand;
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, MessageKind, Survey};
use crate::precondition::{ffs_are_open, Precondition};
use crate::state::SopContext;

const IMPOSSIBLE: &str = "Impossible condition; complain to RHL";

/// Next exposure to take, in bias, dark, flat, arc order
fn next_exposure(calibs: &DoCalibsCmd) -> Option<(ExposureType, f64)> {
    if calibs.n_bias.left > 0 {
        Some((ExposureType::Bias, 0.0))
    } else if calibs.n_dark.left > 0 {
        Some((ExposureType::Dark, calibs.dark_time))
    } else if calibs.n_flat.left > 0 {
        Some((ExposureType::Flat, calibs.flat_time))
    } else if calibs.n_arc.left > 0 {
        Some((ExposureType::Arc, calibs.arc_time))
    } else {
        None
    }
}

fn count_mut(calibs: &mut DoCalibsCmd, exp_type: ExposureType) -> Option<&mut ExposureCount> {
    match exp_type {
        ExposureType::Bias => Some(&mut calibs.n_bias),
        ExposureType::Dark => Some(&mut calibs.n_dark),
        ExposureType::Flat => Some(&mut calibs.n_flat),
        ExposureType::Arc => Some(&mut calibs.n_arc),
        _ => None,
    }
}

fn switch(on: bool) -> MessageKind {
    MessageKind::LampOn { on, delay: None }
}

pub async fn do_calibs(ctx: &SopContext, cmd: &CommandHandle, survey: Survey, cartridge: i32) -> SopResult<()> {
    let state = ctx.commands.do_calibs.clone();
    tracing::info!("doCalibs on cartridge {} ({})", cartridge, survey);

    let ffs_initially_open = ffs_are_open(&ctx.status.snapshot());
    let mut pending_readout = false;
    let mut failure: Option<(&'static str, String)> = None;

    loop {
        report(&*state);
        let (next, guider_flat_time, arcs_done, test) = {
            let calibs = read_cmd(&*state);
            (
                next_exposure(&calibs),
                calibs.guider_flat_time,
                calibs.n_arc.done,
                calibs.test_exposures,
            )
        };
        let Some((exp_type, exp_time)) = next else {
            break;
        };
        let stage = exp_type.as_str();
        begin_stage(&*state, stage)?;

        if pending_readout {
            if !matches!(exp_type, ExposureType::Arc | ExposureType::Flat) {
                failure = Some((stage, IMPOSSIBLE.to_string()));
                break;
            }
            let mut batch = MultiCommand::new(
                ctx,
                Some(cmd.clone()),
                ctx.config.timeout() + ctx.config.readout_duration(),
                "doCalibs.pendingReadout",
            );
            batch
                .append(Device::Boss, MessageKind::Expose(Exposure::pending_readout()))
                .append(Device::WhtLamp, switch(false))
                .append(Device::UvLamp, switch(false));
            if exp_type == ExposureType::Arc {
                batch
                    .append_with_timeout(
                        Device::Ffs,
                        MessageKind::FfsMove { open: false },
                        ctx.config.timeout_plus(ctx.config.ffs_duration_secs),
                    )
                    .append(Device::FfLamp, switch(false))
                    .append(Device::HgCdLamp, switch(true))
                    .append(Device::NeLamp, switch(true));
            }
            pending_readout = false;
            if !batch.run().await {
                failure = Some((stage, format!("Failed to prepare for {}", exp_type)));
                break;
            }
        }

        let mut secs = ctx.config.flush_duration_secs + exp_time + ctx.config.timeout_secs;
        match exp_type {
            ExposureType::Bias | ExposureType::Dark => secs += ctx.config.readout_duration_secs,
            ExposureType::Arc => secs += ctx.config.warmup.hgcd,
            _ => {}
        }
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            crate::config::secs_to_duration(secs),
            "doCalibs.expose",
        );
        batch
            .append_precondition(Precondition::lamp(Device::WhtLamp, false))
            .append_precondition(Precondition::lamp(Device::UvLamp, false));

        let mut exposure = Exposure::new(exp_type, exp_time);
        exposure.test = test;
        match exp_type {
            ExposureType::Arc => {
                pending_readout = true;
                batch
                    .append(Device::Boss, MessageKind::Expose(exposure.without_readout()))
                    .append_precondition(Precondition::ffs(false))
                    .append_precondition(Precondition::lamp(Device::FfLamp, false))
                    .append_precondition(Precondition::lamp(Device::HgCdLamp, true))
                    .append_precondition(Precondition::lamp(Device::NeLamp, true));
            }
            ExposureType::Bias | ExposureType::Dark => {
                batch
                    .append(Device::Boss, MessageKind::Expose(exposure))
                    .append_precondition(Precondition::lamp(Device::FfLamp, false))
                    .append_precondition(Precondition::lamp(Device::HgCdLamp, false))
                    .append_precondition(Precondition::lamp(Device::NeLamp, false));
            }
            ExposureType::Flat => {
                if exp_time > 0.0 {
                    pending_readout = true;
                    batch.append(Device::Boss, MessageKind::Expose(exposure.without_readout()));
                }
                if guider_flat_time > 0.0 && arcs_done == 0 {
                    cmd.inform(format!("Taking a {}s guider flat exposure", guider_flat_time));
                    batch.append(
                        Device::Guider,
                        MessageKind::Expose(Exposure::new(ExposureType::Flat, guider_flat_time)),
                    );
                }
                batch
                    .append_precondition(Precondition::ffs(false))
                    .append_precondition(Precondition::lamp(Device::FfLamp, true))
                    .append_precondition(Precondition::lamp(Device::HgCdLamp, false))
                    .append_precondition(Precondition::lamp(Device::NeLamp, false));
            }
            _ => {
                failure = Some((stage, IMPOSSIBLE.to_string()));
                break;
            }
        }

        cmd.inform(format!("Taking {} {} exposure", exp_type.article(), exp_type));
        if !batch.run().await {
            failure = Some((stage, format!("Failed to take {} exposure", exp_type)));
            break;
        }

        let finished = {
            let mut calibs = write_cmd(&*state);
            match count_mut(&mut calibs, exp_type) {
                Some(count) => {
                    count.record_done();
                    count.left == 0
                }
                None => false,
            }
        };
        if finished {
            complete_stage(&*state, stage)?;
        }
    }

    if let Some((stage, reason)) = failure {
        cleanup_after_failure(ctx, cmd, pending_readout, "doCalibs").await;
        return fail(&*state, cmd, Some(stage), &reason, &reason);
    }

    begin_stage(&*state, "cleanup")?;
    let mut timeout = ctx.config.timeout_plus(ctx.config.ffs_duration_secs);
    if pending_readout {
        timeout += ctx.config.readout_duration();
    }
    let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, "doCalibs.readoutFinish");
    if pending_readout {
        batch.append(Device::Boss, MessageKind::Expose(Exposure::pending_readout()));
    }
    for device in Device::LAMPS {
        batch.append(device, switch(false));
    }
    match ffs_initially_open {
        Some(open) => {
            batch.append(Device::Ffs, MessageKind::FfsMove { open });
        }
        None => tracing::warn!("doCalibs: screen state at start unknown; leaving it as is"),
    }
    if !batch.run().await {
        return fail(
            &*state,
            cmd,
            Some("cleanup"),
            "telescope is in unknown state",
            "Failed to restore telescope to pristine state",
        );
    }
    complete_stage(&*state, "cleanup")?;

    conclude(&*state, cmd, "Your calibration data are ready, sir");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_state::{CommandStatus, SopCommand, StageState};
    use crate::workers::test_support::{context, messages, spawn_devices};

    fn setup(ctx: &SopContext, configure: impl FnOnce(&mut DoCalibsCmd)) -> CommandHandle {
        let cmd = CommandHandle::new("doCalibs", ctx.events.clone());
        let mut calibs = write_cmd(&ctx.commands.do_calibs);
        configure(&mut calibs);
        let active = calibs.active_stages();
        calibs.core_mut().setup_command(cmd.clone(), &active).unwrap();
        cmd
    }

    #[tokio::test]
    async fn test_two_biases() {
        let (ctx, ops) = context();
        let _workers = spawn_devices(&ctx);
        let cmd = setup(&ctx, |c| c.n_bias = ExposureCount::new(2));

        do_calibs(&ctx, &cmd, Survey::Boss, 11).await.unwrap();

        let calibs = read_cmd(&ctx.commands.do_calibs);
        assert_eq!((calibs.n_bias.done, calibs.n_bias.left), (2, 0));
        assert_eq!(calibs.core().status(), CommandStatus::Done);
        assert_eq!(calibs.core().stage("bias"), Some(StageState::Done));
        assert_eq!(calibs.core().stage("cleanup"), Some(StageState::Done));
        assert_eq!(ops.count_calls("boss exposure bias"), 2);
        assert!(!cmd.is_alive());
    }

    #[tokio::test]
    async fn test_flat_then_arc_reads_out_in_between() {
        let (ctx, ops) = context();
        let _workers = spawn_devices(&ctx);
        let cmd = setup(&ctx, |c| {
            c.n_flat = ExposureCount::new(1);
            c.n_arc = ExposureCount::new(1);
        });

        do_calibs(&ctx, &cmd, Survey::Boss, 11).await.unwrap();

        let boss: Vec<String> = ops
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("boss"))
            .collect();
        assert_eq!(
            boss,
            vec![
                "boss exposure flat itime=30 noreadout",
                "boss exposure readout",
                "boss exposure arc itime=4 noreadout",
                "boss exposure readout",
            ]
        );
        let models = ctx.status.snapshot();
        assert_eq!(ffs_are_open(&models), Some(true));
        assert!(!models.hgcd_lamp.unwrap().is_on());
        assert_eq!(read_cmd(&ctx.commands.do_calibs).core().status(), CommandStatus::Done);
    }

    #[tokio::test]
    async fn test_failed_exposure_fails_stage_and_turns_lamps_off() {
        let (ctx, ops) = context();
        ops.fail_on("boss exposure arc");
        let _workers = spawn_devices(&ctx);
        let mut rx = ctx.events.subscribe();
        let cmd = setup(&ctx, |c| c.n_arc = ExposureCount::new(2));

        do_calibs(&ctx, &cmd, Survey::Boss, 11).await.unwrap();

        let calibs = read_cmd(&ctx.commands.do_calibs);
        assert_eq!(calibs.core().status(), CommandStatus::Failed);
        assert_eq!(calibs.core().state_text(), "Failed to take arc exposure");
        assert_eq!(calibs.core().stage("arc"), Some(StageState::Failed));
        assert_eq!(calibs.n_arc.done, 0);
        assert!(messages(&mut rx).contains(&"Failed to take arc exposure".to_string()));
        assert!(!ctx.status.snapshot().ne_lamp.unwrap().is_on());
    }

    #[tokio::test]
    async fn test_abort_ends_aborted() {
        let (ctx, _ops) = context();
        let _workers = spawn_devices(&ctx);
        let cmd = setup(&ctx, |c| c.n_arc = ExposureCount::new(3));
        {
            let mut calibs = write_cmd(&ctx.commands.do_calibs);
            calibs.core_mut().request_abort();
            calibs.clamp_to_done();
        }

        do_calibs(&ctx, &cmd, Survey::Boss, 11).await.unwrap();

        let calibs = read_cmd(&ctx.commands.do_calibs);
        assert_eq!(calibs.core().status(), CommandStatus::Aborted);
        assert_eq!((calibs.n_arc.total, calibs.n_arc.left), (0, 0));
    }

    #[test]
    fn test_exposure_order() {
        let mut calibs = DoCalibsCmd::new(crate::event::EventBus::default(), Default::default());
        calibs.n_arc = ExposureCount::new(1);
        calibs.n_dark = ExposureCount::new(1);
        calibs.dark_time = 300.0;
        assert_eq!(next_exposure(&calibs), Some((ExposureType::Dark, 300.0)));
        calibs.n_dark.record_done();
        assert_eq!(next_exposure(&calibs), Some((ExposureType::Arc, 4.0)));
    }
}
