//! Sequencing procedures run by the master task
//!
//! Each procedure drives one command state through its stages by running
//! coordinator batches one after the other. A failed batch stops the
//! procedure: the stage, the command state and the user command are failed
//! with the same reason. Invalid stage transitions come back as `Err` and are
//! handled by the master.

mod apogee;
mod calibs;
mod dithered_flat;
mod goto_field;
mod hartmann;
mod lamps;
mod position;
mod science;

pub use apogee::{do_apogee_dome_flat, do_apogee_exposures};
pub use calibs::do_calibs;
pub use dithered_flat::{collimator_moves, dithered_flat, CollimatorMove};
pub use goto_field::goto_field;
pub use hartmann::hartmann;
pub use lamps::{do_lamps, LampRequest};
pub use position::{gang_change_target, goto_gang_change, goto_position, position_target};
pub use science::do_science;

use crate::cmd_state::{read_cmd, write_cmd, CommandStatus, SopCommand, StageState};
use crate::coordinator::{post, MultiCommand};
use crate::error::SopResult;
use crate::event::CommandHandle;
use crate::message::{Device, Exposure, MessageKind, Priority};
use crate::precondition::Precondition;
use crate::state::SopContext;
use std::sync::RwLock as StdRwLock;

/// Mark a pending stage running
///
/// A stage that is off, already running or finished is left alone, so a
/// loop can call this on every pass.
pub(crate) fn begin_stage<T: SopCommand>(state: &StdRwLock<T>, stage: &str) -> SopResult<()> {
    let mut s = write_cmd(state);
    match s.core().stage(stage) {
        Some(StageState::Pending) | None => s.core_mut().set_stage_state(stage, StageState::Running),
        Some(_) => Ok(()),
    }
}

/// Mark a running stage done; an aborted stage stays aborted
pub(crate) fn complete_stage<T: SopCommand>(state: &StdRwLock<T>, stage: &str) -> SopResult<()> {
    let mut s = write_cmd(state);
    match s.core().stage(stage) {
        Some(StageState::Running | StageState::Pending) | None => s.core_mut().set_stage_state(stage, StageState::Done),
        Some(_) => Ok(()),
    }
}

pub(crate) fn report<T: SopCommand>(state: &StdRwLock<T>) {
    read_cmd(state).report();
}

/// Fail the command state, optionally one stage, and the user command
///
/// Only a stage that is pending or running is marked failed; an aborted
/// stage keeps its state.
pub(crate) fn fail<T: SopCommand>(
    state: &StdRwLock<T>,
    cmd: &CommandHandle,
    stage: Option<&str>,
    state_text: &str,
    fail_text: &str,
) -> SopResult<()> {
    let staged = {
        let mut s = write_cmd(state);
        let staged = match stage.map(|name| (name, s.core().stage(name))) {
            Some((name, Some(StageState::Pending | StageState::Running) | None)) => {
                s.core_mut().set_stage_state(name, StageState::Failed)
            }
            _ => Ok(()),
        };
        s.set_command_state(CommandStatus::Failed, Some(state_text));
        staged
    };
    cmd.fail(fail_text);
    staged
}

/// Done, or aborted if an abort of this run was requested while running
pub(crate) fn conclude<T: SopCommand>(state: &StdRwLock<T>, cmd: &CommandHandle, done_text: &str) {
    conclude_with(state, cmd, done_text, None);
}

pub(crate) fn conclude_with<T: SopCommand>(
    state: &StdRwLock<T>,
    cmd: &CommandHandle,
    done_text: &str,
    state_text: Option<&str>,
) {
    let mut s = write_cmd(state);
    if s.core().is_aborting() {
        let name = s.core().name();
        s.set_command_state(CommandStatus::Aborted, None);
        drop(s);
        cmd.fail(format!("{} was aborted", name));
    } else {
        s.set_command_state(CommandStatus::Done, state_text);
        drop(s);
        cmd.finish(done_text);
    }
}

/// Add one lamp precondition per lamp bank: on for those in `on`, off for the rest
pub(crate) fn lamp_preconditions(batch: &mut MultiCommand<'_>, on: &[Device]) {
    for lamp in Device::LAMPS {
        batch.append_precondition(Precondition::lamp(lamp, on.contains(&lamp)));
    }
}

/// Tell the master that a hartmann or dithered flat sequence is over
pub(crate) fn post_finished(ctx: &SopContext, cmd: &CommandHandle, success: bool) {
    if !post(
        ctx,
        Device::Master,
        MessageKind::ExposureFinished { success },
        Some(cmd.clone()),
        Priority::Normal,
    ) {
        cmd.fail("cannot report completion to the master");
    }
}

/// Read out anything pending and turn every lamp off
///
/// Run after a failure; a failure here is only warned about.
pub(crate) async fn cleanup_after_failure(ctx: &SopContext, cmd: &CommandHandle, pending_readout: bool, label: &str) {
    let mut timeout = ctx.config.timeout();
    if pending_readout {
        timeout += ctx.config.readout_duration();
    }
    let mut batch = MultiCommand::new(ctx, Some(cmd.clone()), timeout, format!("{}.cleanup", label));
    if pending_readout {
        batch.append(Device::Boss, MessageKind::Expose(Exposure::pending_readout()));
    }
    for lamp in Device::LAMPS {
        batch.append(lamp, MessageKind::LampOn { on: false, delay: None });
    }
    if !batch.run().await {
        if pending_readout {
            cmd.warn("Failed to readout last exposure");
        } else {
            cmd.warn("Failed to turn lamps off");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_state::DoScienceCmd;
    use crate::event::EventBus;

    fn running_science(events: &EventBus) -> (StdRwLock<DoScienceCmd>, CommandHandle) {
        let cmd = CommandHandle::new("doScience", events.clone());
        let mut science = DoScienceCmd::new(events.clone(), Default::default());
        science.core_mut().setup_command(cmd.clone(), &["expose"]).unwrap();
        science.core_mut().set_stage_state("expose", StageState::Running).unwrap();
        (StdRwLock::new(science), cmd)
    }

    #[test]
    fn test_fail_keeps_aborted_stage() {
        let events = EventBus::default();
        let (state, cmd) = running_science(&events);
        write_cmd(&state).core_mut().abort_stages();

        fail(&state, &cmd, Some("expose"), "stopped", "stopped").unwrap();

        let science = read_cmd(&state);
        assert_eq!(science.core().stage("expose"), Some(StageState::Aborted));
        assert_eq!(science.core().status(), CommandStatus::Failed);
        assert!(!cmd.is_alive());
    }

    #[test]
    fn test_conclude_reads_the_run_abort_flag() {
        let events = EventBus::default();
        let (state, cmd) = running_science(&events);
        complete_stage(&state, "expose").unwrap();
        conclude(&state, &cmd, "done");
        assert_eq!(read_cmd(&state).core().status(), CommandStatus::Done);

        let (state, cmd) = running_science(&events);
        write_cmd(&state).core_mut().request_abort();
        complete_stage(&state, "expose").unwrap();
        conclude(&state, &cmd, "done");
        let science = read_cmd(&state);
        assert_eq!(science.core().status(), CommandStatus::Aborted);
        assert_eq!(science.core().stage("expose"), Some(StageState::Done));
    }
}
