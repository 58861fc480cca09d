//! APOGEE dithered exposure sequences and the dome flat

use super::{begin_stage, complete_stage, conclude, fail, lamp_preconditions, report};
use crate::cmd_state::{read_cmd, write_cmd, SopCommand};
use crate::coordinator::MultiCommand;
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, MessageKind};
use crate::precondition::Precondition;
use crate::state::SopContext;
use std::time::Duration;

/// Work through the exposure sequence of doApogeeScience or doApogeeSkyFlats
pub async fn do_apogee_exposures(
    ctx: &SopContext,
    cmd: &CommandHandle,
    exp_type: ExposureType,
    sky_flats: bool,
) -> SopResult<()> {
    let state = if sky_flats {
        ctx.commands.do_apogee_sky_flats.clone()
    } else {
        ctx.commands.do_apogee_science.clone()
    };
    begin_stage(&*state, "expose")?;

    loop {
        report(&*state);
        let (name, index, total, dither, exp_time, comment) = {
            let seq = read_cmd(&*state);
            if seq.index >= seq.exposure_seq.len() {
                break;
            }
            (
                seq.core().name(),
                seq.index,
                seq.exposure_seq.len(),
                seq.exposure_seq[seq.index],
                seq.exp_time,
                seq.comment.clone(),
            )
        };

        let timeout = ctx.config.timeout_plus(exp_time + ctx.config.apogee_dither_secs);
        let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, name);
        let exposure = Exposure::new(exp_type, exp_time)
            .with_dither(dither)
            .with_comment(comment);
        batch.append(Device::Apogee, MessageKind::Expose(exposure));
        if index == 0 {
            batch
                .append_precondition(Precondition::ffs(true))
                .append_precondition(Precondition::apogee_shutter(true));
            lamp_preconditions(&mut batch, &[]);
        }

        cmd.diag(format!("taking {} of {} {} exposure", index, total, exp_type));
        if !batch.run().await {
            let reason = format!("Failed to take an {} exposure", exp_type);
            return fail(&*state, cmd, Some("expose"), &reason, &reason);
        }
        write_cmd(&*state).record_exposure();
    }

    complete_stage(&*state, "expose")?;
    conclude(&*state, cmd, "Your Nobel Prize is a little closer, sir");
    Ok(())
}

/// Budget for the dome flat script beyond the actor timeout
const DOME_FLAT_OVERHEAD_SECS: f64 = 100.0;

pub async fn do_apogee_dome_flat(ctx: &SopContext, cmd: &CommandHandle) -> SopResult<()> {
    let state = ctx.commands.do_apogee_dome_flat.clone();
    begin_stage(&*state, "domeFlat")?;
    report(&*state);

    if !run_dome_flat(ctx, cmd, "doApogeeDomeFlat").await {
        let reason = "Failed to take APOGEE dome flat";
        return fail(&*state, cmd, Some("domeFlat"), reason, reason);
    }
    complete_stage(&*state, "domeFlat")?;
    conclude(&*state, cmd, "Dome flat taken");
    Ok(())
}

/// One dome flat batch; also used before a gang change
pub(crate) async fn run_dome_flat(ctx: &SopContext, cmd: &CommandHandle, label: &str) -> bool {
    let timeout = ctx.config.timeout() + Duration::from_secs_f64(DOME_FLAT_OVERHEAD_SECS);
    let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, label);
    batch
        .append_precondition(Precondition::ffs(false))
        .append(Device::ApogeeScript, MessageKind::ApogeeDomeFlat);
    batch.run().await
}
