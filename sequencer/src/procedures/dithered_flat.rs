use super::{do_lamps, post_finished, LampRequest};
use crate::coordinator::MultiCommand;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, MessageKind, Spectrograph};
use crate::state::SopContext;

/// One collimator step: piston offset and whether a flat follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollimatorMove {
    pub offset: i32,
    pub expose: bool,
}

/// The `n_step + 1` moves of a dithered flat
///
/// Start half the range out, step back by `n_tick`, then return to where
/// the collimators started.
pub fn collimator_moves(n_step: u32, n_tick: i32) -> Vec<CollimatorMove> {
    let mut moves = Vec::with_capacity(n_step as usize + 1);
    let mut moved = 0;
    for i in 0..=n_step {
        let (offset, expose) = if i == 0 {
            (n_tick * (n_step / 2) as i32, true)
        } else if i == n_step {
            (-moved, false)
        } else {
            (-n_tick, true)
        };
        moved += offset;
        moves.push(CollimatorMove { offset, expose });
    }
    moves
}

async fn move_collimators(ctx: &SopContext, cmd: &CommandHandle, spectrographs: &[Spectrograph], offset: i32) -> bool {
    let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), ctx.config.timeout(), "ditheredFlat.moveColl");
    for spectrograph in spectrographs {
        batch.append(
            Device::Boss,
            MessageKind::MoveCollimator {
                spectrograph: *spectrograph,
                a: offset,
                b: offset,
                c: -offset,
            },
        );
    }
    batch.run().await
}

/// Flats at a series of collimator positions
pub async fn dithered_flat(
    ctx: &SopContext,
    cmd: &CommandHandle,
    exp_time: f64,
    spectrographs: &[Spectrograph],
    n_step: u32,
    n_tick: i32,
) {
    let ff_on = LampRequest {
        ff: true,
        ..LampRequest::default()
    };
    if !do_lamps(ctx, Some(cmd.clone()), ff_on).await {
        cmd.warn("Some lamps failed to turn on");
        post_finished(ctx, cmd, false);
        return;
    }

    let mut success = true;
    let mut moved = 0;
    for (i, step) in collimator_moves(n_step, n_tick).into_iter().enumerate() {
        if !move_collimators(ctx, cmd, spectrographs, step.offset).await {
            cmd.warn("Failed to move collimator");
            success = false;
            break;
        }
        moved += step.offset;
        cmd.inform(format!("After {}th collimator move: at {}", i, moved));

        if !step.expose {
            continue;
        }
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            ctx.config.timeout_plus(exp_time + ctx.config.exposure_overhead_secs),
            "ditheredFlat.expose",
        );
        batch.append(
            Device::Boss,
            MessageKind::Expose(Exposure::new(ExposureType::Flat, exp_time).with_spectrographs(spectrographs)),
        );
        if !batch.run().await {
            cmd.warn(format!("Failed to take {}s exposure", exp_time));
            cmd.warn("Moving collimators back to initial positions");
            if !move_collimators(ctx, cmd, spectrographs, -moved).await {
                cmd.warn("Failed to move collimator back to initial position");
            }
            success = false;
            break;
        }
    }

    if !do_lamps(ctx, Some(cmd.clone()), LampRequest::all_off()).await {
        cmd.warn("Failed to turn lamps off");
    }
    post_finished(ctx, cmd, success);
}
