use super::{do_lamps, post_finished, LampRequest};
use crate::coordinator::MultiCommand;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, HartmannScreen, MessageKind, Spectrograph};
use crate::state::SopContext;

/// Left then right Hartmann arcs, leaving lamps and screen as they were
///
/// Completion is reported to the master with EXPOSURE_FINISHED.
pub async fn hartmann(ctx: &SopContext, cmd: &CommandHandle, exp_time: f64, spectrographs: &[Spectrograph]) {
    let ffs_was_open = ctx.status.snapshot().ffs_commanded_open == Some(true);

    let lamps_on = LampRequest {
        hgcd: true,
        ne: true,
        open_ffs: ffs_was_open.then_some(false),
        ..LampRequest::default()
    };
    if !do_lamps(ctx, Some(cmd.clone()), lamps_on).await {
        cmd.warn("Some lamps failed to turn on");
        post_finished(ctx, cmd, false);
        return;
    }

    let mut success = true;
    for screen in [HartmannScreen::Left, HartmannScreen::Right] {
        let exposure = Exposure::new(ExposureType::Arc, exp_time)
            .with_hartmann(screen)
            .with_spectrographs(spectrographs);
        let mut batch = MultiCommand::new(
            ctx,
            Some(cmd.clone()),
            ctx.config.timeout_plus(exp_time + ctx.config.exposure_overhead_secs),
            format!("hartmann.{}", screen.as_str()),
        );
        batch.append(Device::Boss, MessageKind::Expose(exposure));
        if !batch.run().await {
            cmd.warn(format!("Failed to take {}s exposure", exp_time));
            cmd.warn("Moving Hartmann masks out");
            success = false;
            break;
        }
    }

    let restore = LampRequest {
        open_ffs: ffs_was_open.then_some(true),
        ..LampRequest::all_off()
    };
    if !do_lamps(ctx, Some(cmd.clone()), restore).await {
        cmd.warn("Failed to turn lamps off");
        success = false;
    }

    post_finished(ctx, cmd, success);
}
