use super::{begin_stage, complete_stage, conclude, fail, lamp_preconditions, report};
use crate::cmd_state::{read_cmd, write_cmd};
use crate::config::secs_to_duration;
use crate::coordinator::MultiCommand;
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, ExposureType, MessageKind};
use crate::precondition::Precondition;
use crate::state::SopContext;

/// BOSS science exposures until none are left
pub async fn do_science(ctx: &SopContext, cmd: &CommandHandle) -> SopResult<()> {
    let state = ctx.commands.do_science.clone();
    begin_stage(&*state, "expose")?;

    loop {
        report(&*state);
        let (left, exp_time) = {
            let science = read_cmd(&*state);
            (science.n_exp.left, science.exp_time)
        };
        if left == 0 {
            break;
        }

        let config = &ctx.config;
        let timeout = secs_to_duration(
            config.flush_duration_secs + exp_time + config.readout_duration_secs + config.timeout_secs,
        );
        let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, "doScience");
        batch
            .append(
                Device::Boss,
                MessageKind::Expose(Exposure::new(ExposureType::Science, exp_time)),
            )
            .append_precondition(Precondition::ffs(true));
        lamp_preconditions(&mut batch, &[]);

        cmd.inform("Taking a science exposure");
        if !batch.run().await {
            let reason = "Failed to take science exposure";
            return fail(&*state, cmd, Some("expose"), reason, reason);
        }
        write_cmd(&*state).n_exp.record_done();
    }

    complete_stage(&*state, "expose")?;
    conclude(&*state, cmd, "Your Nobel Prize is a little closer, sir");
    Ok(())
}
