//! Staged state of the long-running user commands
//!
//! Each tracked command (doCalibs, gotoField, ...) owns a [`CmdState`]: its
//! declared stages, overall status, a free-form state text and the handle of
//! the user command currently driving it. Command-specific counters and
//! keywords live in the wrapping structs, which all implement [`SopCommand`].
//!
//! The states are shared between the user surface and the master task as
//! `Arc<std::sync::RwLock<_>>`. Locks are never held across an `.await`.

use crate::config::CommandDefaults;
use crate::error::{SopError, SopResult};
use crate::event::{CommandHandle, EventBus, SopEvent};
use crate::message::Survey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, PoisonError, RwLockReadGuard, RwLockWriteGuard};

/// State of one stage of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Off,
    Pending,
    Running,
    Done,
    Failed,
    Aborted,
    Idle,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Off => "off",
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Done => "done",
            StageState::Failed => "failed",
            StageState::Aborted => "aborted",
            StageState::Idle => "idle",
        }
    }

    /// Whether a running command may move a stage from `self` to `to`
    ///
    /// Stages only move forward: pending to running, then to done or
    /// failed. Only a running stage can be aborted. Off, idle and the
    /// terminal states never move; a new run resets them.
    pub fn can_transition_to(self, to: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, to),
            (Pending, Running | Done | Failed) | (Running, Done | Failed | Aborted)
        )
    }
}

impl FromStr for StageState {
    type Err = SopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(StageState::Off),
            "pending" => Ok(StageState::Pending),
            "running" => Ok(StageState::Running),
            "done" => Ok(StageState::Done),
            "failed" => Ok(StageState::Failed),
            "aborted" => Ok(StageState::Aborted),
            "idle" => Ok(StageState::Idle),
            other => Err(SopError::InvalidStageState(other.to_string())),
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Init,
    Running,
    Done,
    Failed,
    Aborted,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Init => "idle",
            CommandStatus::Running => "running",
            CommandStatus::Done => "done",
            CommandStatus::Failed => "failed",
            CommandStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Done | CommandStatus::Failed | CommandStatus::Aborted
        )
    }
}

impl FromStr for CommandStatus {
    type Err = SopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" | "init" => Ok(CommandStatus::Init),
            "running" => Ok(CommandStatus::Running),
            "done" => Ok(CommandStatus::Done),
            "failed" => Ok(CommandStatus::Failed),
            "aborted" => Ok(CommandStatus::Aborted),
            other => Err(SopError::InvalidCommandStatus(other.to_string())),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything reported about one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdStateSnapshot {
    pub name: String,
    pub status: CommandStatus,
    pub state_text: String,
    pub stages: Vec<(String, StageState)>,
    /// Command-specific keys, already formatted as `name_key=value`
    pub user_keys: Vec<String>,
}

impl CmdStateSnapshot {
    pub fn stage(&self, stage: &str) -> Option<StageState> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, state)| *state)
    }
}

/// Stage bookkeeping shared by every command
pub struct CmdState {
    name: &'static str,
    stages: Vec<(&'static str, StageState)>,
    status: CommandStatus,
    state_text: String,
    cmd: Option<CommandHandle>,
    aborting: bool,
    events: EventBus,
}

impl CmdState {
    pub fn new(name: &'static str, stages: &[&'static str], events: EventBus) -> Self {
        Self {
            name,
            stages: stages.iter().map(|s| (*s, StageState::Idle)).collect(),
            status: CommandStatus::Init,
            state_text: String::new(),
            cmd: None,
            aborting: false,
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    pub fn state_text(&self) -> &str {
        &self.state_text
    }

    pub fn cmd(&self) -> Option<&CommandHandle> {
        self.cmd.as_ref()
    }

    /// Whether a user command is currently driving this state
    pub fn is_alive(&self) -> bool {
        self.cmd.as_ref().map_or(false, |c| c.is_alive())
    }

    /// An abort was requested for the current run
    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    /// Flag the current run as aborting; cleared by the next setup
    pub fn request_abort(&mut self) {
        self.aborting = true;
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        self.stages.iter().any(|(name, _)| *name == stage)
    }

    pub fn stage(&self, stage: &str) -> Option<StageState> {
        self.stages
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, state)| *state)
    }

    /// Replace the declared stages; all of them start idle
    pub fn set_stages(&mut self, stages: &[&'static str]) {
        self.stages = stages.iter().map(|s| (*s, StageState::Idle)).collect();
    }

    /// Back to idle with no run in progress
    pub fn reinitialize(&mut self) {
        for (_, state) in self.stages.iter_mut() {
            *state = StageState::Idle;
        }
        self.status = CommandStatus::Init;
        self.state_text.clear();
        self.aborting = false;
        self.publish_stages();
    }

    /// Bind a new user command: active stages become pending, the rest off
    ///
    /// This and [`reinitialize`](Self::reinitialize) are the only resets;
    /// every stage is published so listeners drop the previous run.
    pub fn setup_command(&mut self, handle: CommandHandle, active: &[&str]) -> SopResult<()> {
        if let Some(unknown) = active.iter().find(|s| !self.has_stage(s)) {
            return Err(SopError::InvalidStage {
                command: self.name.to_string(),
                stage: unknown.to_string(),
            });
        }
        for (name, state) in self.stages.iter_mut() {
            *state = if active.contains(name) {
                StageState::Pending
            } else {
                StageState::Off
            };
        }
        self.cmd = Some(handle);
        self.status = CommandStatus::Running;
        self.state_text = "OK".to_string();
        self.aborting = false;
        self.publish_stages();
        Ok(())
    }

    fn stage_entry(&mut self, stage: &str) -> SopResult<&mut (&'static str, StageState)> {
        let command = self.name;
        self.stages
            .iter_mut()
            .find(|(name, _)| *name == stage)
            .ok_or_else(|| SopError::InvalidStage {
                command: command.to_string(),
                stage: stage.to_string(),
            })
    }

    /// Move a stage forward; see [`StageState::can_transition_to`]
    ///
    /// Setting the state a stage already has is a no-op.
    pub fn set_stage_state(&mut self, stage: &str, state: StageState) -> SopResult<()> {
        let command = self.name;
        let entry = self.stage_entry(stage)?;
        if entry.1 == state {
            return Ok(());
        }
        if !entry.1.can_transition_to(state) {
            return Err(SopError::InvalidStageTransition {
                command: command.to_string(),
                stage: stage.to_string(),
                from: entry.1,
                to: state,
            });
        }
        entry.1 = state;
        tracing::debug!("{} stage {} -> {}", command, stage, state);
        self.publish_stage(stage, state);
        Ok(())
    }

    /// Add a stage that has not started to the run, or drop it from the run
    pub fn set_stage_active(&mut self, stage: &str, active: bool) -> SopResult<()> {
        let command = self.name;
        let to = if active { StageState::Pending } else { StageState::Off };
        let entry = self.stage_entry(stage)?;
        if entry.1 == to {
            return Ok(());
        }
        if !matches!(entry.1, StageState::Pending | StageState::Off | StageState::Idle) {
            return Err(SopError::InvalidStageTransition {
                command: command.to_string(),
                stage: stage.to_string(),
                from: entry.1,
                to,
            });
        }
        entry.1 = to;
        self.publish_stage(stage, to);
        Ok(())
    }

    fn publish_stage(&self, stage: &str, state: StageState) {
        self.events.publish(SopEvent::StageChanged {
            command: self.name.to_string(),
            stage: stage.to_string(),
            state,
        });
    }

    fn publish_stages(&self) {
        for (name, state) in &self.stages {
            self.publish_stage(name, *state);
        }
    }

    /// String form of [`set_stage_state`](Self::set_stage_state)
    pub fn set_stage_state_str(&mut self, stage: &str, state: &str) -> SopResult<()> {
        let state = state.parse()?;
        self.set_stage_state(stage, state)
    }

    /// Flag the run as aborting: running stages become aborted, pending ones off
    pub fn abort_stages(&mut self) {
        self.aborting = true;
        for (name, state) in self.stages.iter_mut() {
            let next = match state {
                StageState::Running => StageState::Aborted,
                StageState::Pending => StageState::Off,
                _ => continue,
            };
            *state = next;
            self.events.publish(SopEvent::StageChanged {
                command: self.name.to_string(),
                stage: name.to_string(),
                state: next,
            });
        }
    }

    fn set_status(&mut self, status: CommandStatus, text: Option<&str>) {
        self.status = status;
        if let Some(text) = text {
            self.state_text = text.to_string();
        }
        if status.is_terminal() {
            self.cmd = None;
        }
        tracing::info!("{} is {}: {}", self.name, status, self.state_text);
    }

    fn snapshot_with(&self, user_keys: Vec<String>) -> CmdStateSnapshot {
        CmdStateSnapshot {
            name: self.name.to_string(),
            status: self.status,
            state_text: self.state_text.clone(),
            stages: self
                .stages
                .iter()
                .map(|(name, state)| (name.to_string(), *state))
                .collect(),
            user_keys,
        }
    }
}

impl fmt::Debug for CmdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdState")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .field("status", &self.status)
            .field("state_text", &self.state_text)
            .field("alive", &self.is_alive())
            .field("aborting", &self.aborting)
            .finish()
    }
}

/// Behaviour common to every tracked command
pub trait SopCommand: Send + Sync {
    fn core(&self) -> &CmdState;
    fn core_mut(&mut self) -> &mut CmdState;

    /// Command-specific progress keys
    fn user_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Restore keyword defaults and zero the counters
    fn reset_keywords(&mut self) {}

    fn snapshot(&self) -> CmdStateSnapshot {
        self.core().snapshot_with(self.user_keys())
    }

    /// Record the overall status and report the full state
    ///
    /// A terminal status releases the owning user command.
    fn set_command_state(&mut self, status: CommandStatus, text: Option<&str>) {
        self.core_mut().set_status(status, text);
        let snapshot = self.snapshot();
        self.core().events.publish(SopEvent::CommandState(snapshot));
    }

    /// Publish the current snapshot without changing anything
    fn report(&self) {
        self.core().events.publish(SopEvent::CommandState(self.snapshot()));
    }
}

/// Command with nothing but stages
#[derive(Debug)]
pub struct SimpleCmd {
    core: CmdState,
}

impl SimpleCmd {
    pub fn new(name: &'static str, stages: &[&'static str], events: EventBus) -> Self {
        Self {
            core: CmdState::new(name, stages, events),
        }
    }
}

impl SopCommand for SimpleCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }
}

/// One counted exposure type: total requested, done, still to take
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExposureCount {
    pub total: u32,
    pub done: u32,
    pub left: u32,
}

impl ExposureCount {
    pub fn new(total: u32) -> Self {
        Self { total, done: 0, left: total }
    }

    /// Change the total of a running sequence; what is left is recomputed
    pub fn modify(&mut self, total: u32) {
        self.total = total;
        self.left = total.saturating_sub(self.done);
    }

    /// Stop after what has already been taken
    pub fn clamp_to_done(&mut self) {
        self.total = self.done;
        self.left = 0;
    }

    /// One exposure taken; a total clamped by an abort grows to cover it
    pub fn record_done(&mut self) {
        self.done += 1;
        self.left = self.left.saturating_sub(1);
        self.total = self.total.max(self.done);
    }

    fn key(&self) -> String {
        format!("{},{}", self.done, self.total)
    }
}

#[derive(Debug)]
pub struct DoCalibsCmd {
    core: CmdState,
    pub n_bias: ExposureCount,
    pub n_dark: ExposureCount,
    pub n_flat: ExposureCount,
    pub n_arc: ExposureCount,
    pub dark_time: f64,
    pub flat_time: f64,
    pub arc_time: f64,
    pub guider_flat_time: f64,
    pub test_exposures: bool,
    defaults: CommandDefaults,
}

impl DoCalibsCmd {
    pub const STAGES: [&'static str; 5] = ["bias", "dark", "flat", "arc", "cleanup"];

    pub fn new(events: EventBus, defaults: CommandDefaults) -> Self {
        Self {
            core: CmdState::new("doCalibs", &Self::STAGES, events),
            n_bias: ExposureCount::default(),
            n_dark: ExposureCount::default(),
            n_flat: ExposureCount::default(),
            n_arc: ExposureCount::default(),
            dark_time: 0.0,
            flat_time: defaults.flat_time,
            arc_time: defaults.arc_time,
            guider_flat_time: 0.0,
            test_exposures: false,
            defaults,
        }
    }

    /// Stages that have work for the current counts
    pub fn active_stages(&self) -> Vec<&'static str> {
        let mut stages = Vec::new();
        if self.n_bias.total > 0 {
            stages.push("bias");
        }
        if self.n_dark.total > 0 {
            stages.push("dark");
        }
        if self.n_flat.total > 0 {
            stages.push("flat");
        }
        if self.n_arc.total > 0 {
            stages.push("arc");
        }
        stages.push("cleanup");
        stages
    }

    pub fn total_requested(&self) -> u32 {
        self.n_bias.total + self.n_dark.total + self.n_flat.total + self.n_arc.total
    }

    pub fn clamp_to_done(&mut self) {
        self.n_bias.clamp_to_done();
        self.n_dark.clamp_to_done();
        self.n_flat.clamp_to_done();
        self.n_arc.clamp_to_done();
    }
}

impl SopCommand for DoCalibsCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }

    fn user_keys(&self) -> Vec<String> {
        vec![
            format!("doCalibs_nBias={}", self.n_bias.key()),
            format!("doCalibs_nDark={}", self.n_dark.key()),
            format!("doCalibs_nFlat={}", self.n_flat.key()),
            format!("doCalibs_nArc={}", self.n_arc.key()),
            format!("doCalibs_darkTime={}", self.dark_time),
            format!("doCalibs_flatTime={},{}", self.flat_time, self.defaults.flat_time),
            format!("doCalibs_arcTime={},{}", self.arc_time, self.defaults.arc_time),
            format!(
                "doCalibs_guiderFlatTime={},{}",
                self.guider_flat_time, self.defaults.guider_flat_time
            ),
        ]
    }

    fn reset_keywords(&mut self) {
        self.n_bias = ExposureCount::default();
        self.n_dark = ExposureCount::default();
        self.n_flat = ExposureCount::default();
        self.n_arc = ExposureCount::default();
        self.dark_time = 0.0;
        self.flat_time = self.defaults.flat_time;
        self.arc_time = self.defaults.arc_time;
        self.guider_flat_time = 0.0;
        self.test_exposures = false;
    }
}

#[derive(Debug)]
pub struct DoScienceCmd {
    core: CmdState,
    pub n_exp: ExposureCount,
    pub exp_time: f64,
    defaults: CommandDefaults,
}

impl DoScienceCmd {
    pub fn new(events: EventBus, defaults: CommandDefaults) -> Self {
        Self {
            core: CmdState::new("doScience", &["expose"], events),
            n_exp: ExposureCount::default(),
            exp_time: defaults.science_exp_time,
            defaults,
        }
    }
}

impl SopCommand for DoScienceCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }

    fn user_keys(&self) -> Vec<String> {
        vec![
            format!("doScience_nExp={}", self.n_exp.key()),
            format!("doScience_expTime={},{}", self.exp_time, self.defaults.science_exp_time),
        ]
    }

    fn reset_keywords(&mut self) {
        self.n_exp = ExposureCount::default();
        self.exp_time = self.defaults.science_exp_time;
    }
}

/// Dithered APOGEE sequence: science or sky flats
#[derive(Debug)]
pub struct ApogeeSequenceCmd {
    core: CmdState,
    pub exp_time: f64,
    pub dither_seq: String,
    pub seq_count: u32,
    pub seq_done: u32,
    /// Dither position of every exposure, `dither_seq` repeated `seq_count` times
    pub exposure_seq: Vec<char>,
    /// Next exposure to take
    pub index: usize,
    pub comment: String,
    default_exp_time: f64,
    default_seq_count: u32,
    default_dither_seq: String,
}

impl ApogeeSequenceCmd {
    pub fn science(events: EventBus, defaults: &CommandDefaults) -> Self {
        Self::build(
            "doApogeeScience",
            events,
            defaults.apogee_exp_time,
            defaults.apogee_seq_count,
            defaults.apogee_dither_seq.clone(),
        )
    }

    pub fn sky_flats(events: EventBus, defaults: &CommandDefaults) -> Self {
        Self::build(
            "doApogeeSkyFlats",
            events,
            defaults.sky_flat_exp_time,
            1,
            defaults.apogee_dither_seq.clone(),
        )
    }

    fn build(
        name: &'static str,
        events: EventBus,
        exp_time: f64,
        seq_count: u32,
        dither_seq: String,
    ) -> Self {
        let mut cmd = Self {
            core: CmdState::new(name, &["expose"], events),
            exp_time,
            dither_seq: dither_seq.clone(),
            seq_count,
            seq_done: 0,
            exposure_seq: Vec::new(),
            index: 0,
            comment: String::new(),
            default_exp_time: exp_time,
            default_seq_count: seq_count,
            default_dither_seq: dither_seq,
        };
        cmd.rebuild_sequence();
        cmd
    }

    /// Recompute `exposure_seq` from `dither_seq` and `seq_count`
    pub fn rebuild_sequence(&mut self) {
        self.exposure_seq = self
            .dither_seq
            .chars()
            .cycle()
            .take(self.dither_seq.chars().count() * self.seq_count as usize)
            .collect();
    }

    pub fn sequence_string(&self) -> String {
        self.exposure_seq.iter().collect()
    }

    pub fn remaining(&self) -> usize {
        self.exposure_seq.len().saturating_sub(self.index)
    }

    /// Record one exposure taken; sequences done round up
    pub fn record_exposure(&mut self) {
        self.index += 1;
        let per_seq = self.dither_seq.chars().count().max(1);
        self.seq_done = ((self.index + per_seq - 1) / per_seq) as u32;
    }

    /// Drop everything not yet started
    pub fn truncate_to_index(&mut self) {
        self.exposure_seq.truncate(self.index);
    }
}

impl SopCommand for ApogeeSequenceCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }

    fn user_keys(&self) -> Vec<String> {
        let name = self.core.name();
        vec![
            format!("{}_seqCount={},{}", name, self.seq_done, self.seq_count),
            format!("{}_sequenceState=\"{}\",{}", name, self.sequence_string(), self.index),
            format!("{}_expTime={},{}", name, self.exp_time, self.default_exp_time),
        ]
    }

    fn reset_keywords(&mut self) {
        self.exp_time = self.default_exp_time;
        self.seq_count = self.default_seq_count;
        self.dither_seq = self.default_dither_seq.clone();
        self.seq_done = 0;
        self.index = 0;
        self.comment.clear();
        self.rebuild_sequence();
    }
}

#[derive(Debug)]
pub struct GotoFieldCmd {
    core: CmdState,
    pub do_slew: bool,
    pub do_hartmann: bool,
    pub do_guider: bool,
    pub do_guider_flat: bool,
    pub keep_offsets: bool,
    pub n_arc: ExposureCount,
    pub n_flat: ExposureCount,
    pub arc_time: f64,
    pub flat_time: f64,
    pub guider_time: f64,
    pub guider_flat_time: f64,
    pub ra: f64,
    pub dec: f64,
    pub rotang: f64,
    pub fake_az: Option<f64>,
    pub fake_alt: Option<f64>,
    pub fake_rot_offset: f64,
    defaults: CommandDefaults,
}

impl GotoFieldCmd {
    pub const BOSS_STAGES: [&'static str; 4] = ["slew", "hartmann", "calibs", "guider"];
    pub const OTHER_STAGES: [&'static str; 2] = ["slew", "guider"];

    pub fn new(events: EventBus, defaults: CommandDefaults) -> Self {
        Self {
            core: CmdState::new("gotoField", &Self::BOSS_STAGES, events),
            do_slew: false,
            do_hartmann: false,
            do_guider: false,
            do_guider_flat: false,
            keep_offsets: false,
            n_arc: ExposureCount::default(),
            n_flat: ExposureCount::default(),
            arc_time: defaults.arc_time,
            flat_time: defaults.flat_time,
            guider_time: defaults.guider_time,
            guider_flat_time: defaults.guider_flat_time,
            ra: 0.0,
            dec: 0.0,
            rotang: 0.0,
            fake_az: None,
            fake_alt: None,
            fake_rot_offset: 0.0,
            defaults,
        }
    }

    pub fn stages_for(survey: Survey) -> &'static [&'static str] {
        match survey {
            Survey::Boss => &Self::BOSS_STAGES,
            _ => &Self::OTHER_STAGES,
        }
    }

    pub fn do_calibs(&self) -> bool {
        self.n_arc.total > 0 || self.n_flat.total > 0
    }

    pub fn active_stages(&self) -> Vec<&'static str> {
        let mut stages = Vec::new();
        if self.do_slew {
            stages.push("slew");
        }
        if self.do_hartmann {
            stages.push("hartmann");
        }
        if self.do_calibs() {
            stages.push("calibs");
        }
        if self.do_guider {
            stages.push("guider");
        }
        stages
    }

    /// Nothing more to do in any stage
    pub fn clamp_to_done(&mut self) {
        self.do_slew = false;
        self.do_hartmann = false;
        self.do_guider = false;
        self.n_arc.done = self.n_arc.total;
        self.n_arc.left = 0;
        self.n_flat.done = self.n_flat.total;
        self.n_flat.left = 0;
    }
}

impl SopCommand for GotoFieldCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }

    fn user_keys(&self) -> Vec<String> {
        vec![
            format!("gotoField_arcTime={},{}", self.arc_time, self.defaults.arc_time),
            format!("gotoField_flatTime={},{}", self.flat_time, self.defaults.flat_time),
            format!("gotoField_guiderTime={},{}", self.guider_time, self.defaults.guider_time),
            format!(
                "gotoField_guiderFlatTime={},{}",
                self.guider_flat_time, self.defaults.guider_flat_time
            ),
        ]
    }

    fn reset_keywords(&mut self) {
        self.arc_time = self.defaults.arc_time;
        self.flat_time = self.defaults.flat_time;
        self.guider_time = self.defaults.guider_time;
        self.guider_flat_time = self.defaults.guider_flat_time;
        self.n_arc = ExposureCount::default();
        self.n_flat = ExposureCount::default();
        self.keep_offsets = false;
    }
}

#[derive(Debug)]
pub struct GotoGangChangeCmd {
    core: CmdState,
    pub alt: f64,
    default_alt: f64,
}

impl GotoGangChangeCmd {
    pub fn new(events: EventBus, defaults: &CommandDefaults) -> Self {
        Self {
            core: CmdState::new("gotoGangChange", &["slew"], events),
            alt: defaults.gang_change_alt,
            default_alt: defaults.gang_change_alt,
        }
    }
}

impl SopCommand for GotoGangChangeCmd {
    fn core(&self) -> &CmdState {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CmdState {
        &mut self.core
    }

    fn user_keys(&self) -> Vec<String> {
        vec![format!("gotoGangChange_alt={},{}", self.alt, self.default_alt)]
    }

    fn reset_keywords(&mut self) {
        self.alt = self.default_alt;
    }
}

/// Shared handle to one command state
pub type SharedCmd<T> = Arc<StdRwLock<T>>;

/// Read lock that survives a poisoned lock
pub fn read_cmd<T>(cmd: &StdRwLock<T>) -> RwLockReadGuard<'_, T> {
    cmd.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_cmd<T>(cmd: &StdRwLock<T>) -> RwLockWriteGuard<'_, T> {
    cmd.write().unwrap_or_else(PoisonError::into_inner)
}

fn shared<T>(cmd: T) -> SharedCmd<T> {
    Arc::new(StdRwLock::new(cmd))
}

/// Every tracked command, in reporting order
pub struct CommandStates {
    pub goto_field: SharedCmd<GotoFieldCmd>,
    pub do_calibs: SharedCmd<DoCalibsCmd>,
    pub do_science: SharedCmd<DoScienceCmd>,
    pub do_apogee_science: SharedCmd<ApogeeSequenceCmd>,
    pub do_apogee_sky_flats: SharedCmd<ApogeeSequenceCmd>,
    pub do_apogee_dome_flat: SharedCmd<SimpleCmd>,
    pub goto_gang_change: SharedCmd<GotoGangChangeCmd>,
    pub goto_stow: SharedCmd<SimpleCmd>,
    pub goto_instrument_change: SharedCmd<SimpleCmd>,
    events: EventBus,
    defaults: CommandDefaults,
}

impl CommandStates {
    pub const NAMES: [&'static str; 9] = [
        "gotoField",
        "doCalibs",
        "doScience",
        "doApogeeScience",
        "doApogeeSkyFlats",
        "doApogeeDomeFlat",
        "gotoGangChange",
        "gotoStow",
        "gotoInstrumentChange",
    ];

    pub fn new(events: EventBus, defaults: CommandDefaults) -> Self {
        Self {
            goto_field: shared(GotoFieldCmd::new(events.clone(), defaults.clone())),
            do_calibs: shared(DoCalibsCmd::new(events.clone(), defaults.clone())),
            do_science: shared(DoScienceCmd::new(events.clone(), defaults.clone())),
            do_apogee_science: shared(ApogeeSequenceCmd::science(events.clone(), &defaults)),
            do_apogee_sky_flats: shared(ApogeeSequenceCmd::sky_flats(events.clone(), &defaults)),
            do_apogee_dome_flat: shared(SimpleCmd::new("doApogeeDomeFlat", &["domeFlat"], events.clone())),
            goto_gang_change: shared(GotoGangChangeCmd::new(events.clone(), &defaults)),
            goto_stow: shared(SimpleCmd::new("gotoStow", &["slew"], events.clone())),
            goto_instrument_change: shared(SimpleCmd::new("gotoInstrumentChange", &["slew"], events.clone())),
            events,
            defaults,
        }
    }

    /// Recreate every command state in place
    ///
    /// Anything holding one of the shared handles sees the fresh state.
    pub fn reinit(&self) {
        let events = self.events.clone();
        let defaults = self.defaults.clone();
        *write_cmd(&self.goto_field) = GotoFieldCmd::new(events.clone(), defaults.clone());
        *write_cmd(&self.do_calibs) = DoCalibsCmd::new(events.clone(), defaults.clone());
        *write_cmd(&self.do_science) = DoScienceCmd::new(events.clone(), defaults.clone());
        *write_cmd(&self.do_apogee_science) = ApogeeSequenceCmd::science(events.clone(), &defaults);
        *write_cmd(&self.do_apogee_sky_flats) = ApogeeSequenceCmd::sky_flats(events.clone(), &defaults);
        *write_cmd(&self.do_apogee_dome_flat) = SimpleCmd::new("doApogeeDomeFlat", &["domeFlat"], events.clone());
        *write_cmd(&self.goto_gang_change) = GotoGangChangeCmd::new(events.clone(), &defaults);
        *write_cmd(&self.goto_stow) = SimpleCmd::new("gotoStow", &["slew"], events.clone());
        *write_cmd(&self.goto_instrument_change) = SimpleCmd::new("gotoInstrumentChange", &["slew"], events);
    }

    /// Snapshots of every command, or only `only` when given
    pub fn snapshots(&self, only: Option<&str>) -> Vec<CmdStateSnapshot> {
        let all = vec![
            read_cmd(&self.goto_field).snapshot(),
            read_cmd(&self.do_calibs).snapshot(),
            read_cmd(&self.do_science).snapshot(),
            read_cmd(&self.do_apogee_science).snapshot(),
            read_cmd(&self.do_apogee_sky_flats).snapshot(),
            read_cmd(&self.do_apogee_dome_flat).snapshot(),
            read_cmd(&self.goto_gang_change).snapshot(),
            read_cmd(&self.goto_stow).snapshot(),
            read_cmd(&self.goto_instrument_change).snapshot(),
        ];
        match only {
            Some(name) => all.into_iter().filter(|s| s.name == name).collect(),
            None => all,
        }
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.with_command(name, |cmd| cmd.core().is_alive())
            .unwrap_or(false)
    }

    /// Run `f` on the named command under its write lock
    pub fn with_command<R>(&self, name: &str, f: impl FnOnce(&mut dyn SopCommand) -> R) -> Option<R> {
        let result = match name {
            "gotoField" => f(&mut *write_cmd(&self.goto_field)),
            "doCalibs" => f(&mut *write_cmd(&self.do_calibs)),
            "doScience" => f(&mut *write_cmd(&self.do_science)),
            "doApogeeScience" => f(&mut *write_cmd(&self.do_apogee_science)),
            "doApogeeSkyFlats" => f(&mut *write_cmd(&self.do_apogee_sky_flats)),
            "doApogeeDomeFlat" => f(&mut *write_cmd(&self.do_apogee_dome_flat)),
            "gotoGangChange" => f(&mut *write_cmd(&self.goto_gang_change)),
            "gotoStow" => f(&mut *write_cmd(&self.goto_stow)),
            "gotoInstrumentChange" => f(&mut *write_cmd(&self.goto_instrument_change)),
            _ => return None,
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::default()
    }

    #[test]
    fn test_stage_state_parsing() {
        assert_eq!("running".parse::<StageState>().unwrap(), StageState::Running);
        assert_eq!(
            "sleeping".parse::<StageState>(),
            Err(SopError::InvalidStageState("sleeping".to_string()))
        );
        assert!("bogus".parse::<CommandStatus>().is_err());
        assert!(CommandStatus::Aborted.is_terminal());
        assert!(!CommandStatus::Running.is_terminal());
    }

    #[test]
    fn test_setup_marks_active_pending_rest_off() {
        let events = bus();
        let mut calibs = DoCalibsCmd::new(events.clone(), CommandDefaults::default());
        calibs.n_bias = ExposureCount::new(2);
        let active = calibs.active_stages();
        calibs
            .core_mut()
            .setup_command(CommandHandle::new("doCalibs", events), &active)
            .unwrap();

        let snapshot = calibs.snapshot();
        assert_eq!(snapshot.stage("bias"), Some(StageState::Pending));
        assert_eq!(snapshot.stage("cleanup"), Some(StageState::Pending));
        assert_eq!(snapshot.stage("arc"), Some(StageState::Off));
        assert!(snapshot
            .stages
            .iter()
            .all(|(_, s)| matches!(s, StageState::Pending | StageState::Off)));
        assert!(calibs.core().is_alive());
    }

    #[test]
    fn test_undeclared_stage_is_rejected() {
        let events = bus();
        let mut cmd = SimpleCmd::new("gotoStow", &["slew"], events.clone());
        assert!(matches!(
            cmd.core_mut().set_stage_state("guider", StageState::Running),
            Err(SopError::InvalidStage { .. })
        ));
        assert!(cmd
            .core_mut()
            .setup_command(CommandHandle::new("gotoStow", events), &["hartmann"])
            .is_err());
        assert!(matches!(
            cmd.core_mut().set_stage_state_str("slew", "resting"),
            Err(SopError::InvalidStageState(_))
        ));
    }

    #[test]
    fn test_terminal_status_releases_command() {
        let events = bus();
        let mut cmd = SimpleCmd::new("gotoStow", &["slew"], events.clone());
        cmd.core_mut()
            .setup_command(CommandHandle::new("gotoStow", events.clone()), &["slew"])
            .unwrap();
        let mut rx = events.subscribe();
        cmd.set_command_state(CommandStatus::Done, Some("at stow"));
        assert!(cmd.core().cmd().is_none());
        assert_eq!(cmd.core().state_text(), "at stow");

        match rx.try_recv() {
            Ok(SopEvent::CommandState(snapshot)) => assert_eq!(snapshot.status, CommandStatus::Done),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_abort_stages() {
        let events = bus();
        let mut field = GotoFieldCmd::new(events.clone(), CommandDefaults::default());
        field
            .core_mut()
            .setup_command(CommandHandle::new("gotoField", events), &["slew", "calibs", "guider"])
            .unwrap();
        field.core_mut().set_stage_state("slew", StageState::Done).unwrap();
        field.core_mut().set_stage_state("calibs", StageState::Running).unwrap();
        field.core_mut().abort_stages();

        let snapshot = field.snapshot();
        assert_eq!(snapshot.stage("slew"), Some(StageState::Done));
        assert_eq!(snapshot.stage("hartmann"), Some(StageState::Off));
        assert_eq!(snapshot.stage("calibs"), Some(StageState::Aborted));
        assert_eq!(snapshot.stage("guider"), Some(StageState::Off));
    }

    #[test]
    fn test_reinitialize_idles_stages() {
        let events = bus();
        let mut cmd = SimpleCmd::new("gotoStow", &["slew"], events.clone());
        cmd.core_mut()
            .setup_command(CommandHandle::new("gotoStow", events), &["slew"])
            .unwrap();
        cmd.core_mut().set_stage_state("slew", StageState::Running).unwrap();
        cmd.core_mut().abort_stages();
        cmd.set_command_state(CommandStatus::Aborted, Some("no"));
        cmd.core_mut().reinitialize();
        assert_eq!(cmd.core().stage("slew"), Some(StageState::Idle));
        assert_eq!(cmd.core().status(), CommandStatus::Init);
        assert_eq!(cmd.core().state_text(), "");
        assert!(!cmd.core().is_aborting());
    }

    #[test]
    fn test_stages_only_move_forward() {
        let events = bus();
        let mut calibs = DoCalibsCmd::new(events.clone(), CommandDefaults::default());
        calibs
            .core_mut()
            .setup_command(CommandHandle::new("doCalibs", events), &["bias", "cleanup"])
            .unwrap();
        let core = calibs.core_mut();

        core.set_stage_state("bias", StageState::Running).unwrap();
        core.set_stage_state("bias", StageState::Done).unwrap();
        assert!(matches!(
            core.set_stage_state("bias", StageState::Running),
            Err(SopError::InvalidStageTransition {
                from: StageState::Done,
                to: StageState::Running,
                ..
            })
        ));
        assert!(core.set_stage_state("arc", StageState::Running).is_err());
        assert!(core.set_stage_state("cleanup", StageState::Aborted).is_err());
        // Repeating the current state changes nothing
        core.set_stage_state("bias", StageState::Done).unwrap();

        assert_eq!(core.stage("bias"), Some(StageState::Done));
        assert_eq!(core.stage("arc"), Some(StageState::Off));
        assert_eq!(core.stage("cleanup"), Some(StageState::Pending));
    }

    #[test]
    fn test_aborted_stage_cannot_fail() {
        let events = bus();
        let mut science = DoScienceCmd::new(events.clone(), CommandDefaults::default());
        science
            .core_mut()
            .setup_command(CommandHandle::new("doScience", events), &["expose"])
            .unwrap();
        science.core_mut().set_stage_state("expose", StageState::Running).unwrap();
        science.core_mut().abort_stages();
        assert!(science.core().is_aborting());
        assert!(science
            .core_mut()
            .set_stage_state("expose", StageState::Failed)
            .is_err());
        assert_eq!(science.core().stage("expose"), Some(StageState::Aborted));
    }

    #[test]
    fn test_stage_activation_only_before_start() {
        let events = bus();
        let mut field = GotoFieldCmd::new(events.clone(), CommandDefaults::default());
        field
            .core_mut()
            .setup_command(CommandHandle::new("gotoField", events), &["slew", "guider"])
            .unwrap();
        let core = field.core_mut();
        core.set_stage_active("calibs", true).unwrap();
        core.set_stage_active("guider", false).unwrap();
        core.set_stage_state("slew", StageState::Running).unwrap();
        assert!(core.set_stage_active("slew", false).is_err());

        assert_eq!(core.stage("calibs"), Some(StageState::Pending));
        assert_eq!(core.stage("guider"), Some(StageState::Off));
        assert_eq!(core.stage("slew"), Some(StageState::Running));
    }

    #[test]
    fn test_setup_publishes_every_stage() {
        let events = bus();
        let mut calibs = DoCalibsCmd::new(events.clone(), CommandDefaults::default());
        calibs
            .core_mut()
            .setup_command(CommandHandle::new("doCalibs", events.clone()), &["arc", "cleanup"])
            .unwrap();
        calibs.core_mut().set_stage_state("arc", StageState::Running).unwrap();
        calibs.core_mut().set_stage_state("arc", StageState::Failed).unwrap();

        let mut rx = events.subscribe();
        calibs
            .core_mut()
            .setup_command(CommandHandle::new("doCalibs", events), &["bias", "cleanup"])
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SopEvent::StageChanged { command, stage, state } = event {
                assert_eq!(command, "doCalibs");
                seen.push((stage, state));
            }
        }
        assert_eq!(seen.len(), DoCalibsCmd::STAGES.len());
        assert!(seen.contains(&("arc".to_string(), StageState::Off)));
        assert!(seen.contains(&("bias".to_string(), StageState::Pending)));

        let mut rx = calibs.core().events.subscribe();
        calibs.core_mut().reinitialize();
        let idle = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, SopEvent::StageChanged { state: StageState::Idle, .. }))
            .count();
        assert_eq!(idle, DoCalibsCmd::STAGES.len());
    }

    #[test]
    fn test_modify_recomputes_left() {
        let mut count = ExposureCount::new(3);
        count.record_done();
        count.modify(3);
        assert_eq!(count.left, 2);
        count.modify(1);
        assert_eq!(count.left, 0);
        count.clamp_to_done();
        assert_eq!((count.total, count.done, count.left), (1, 1, 0));
    }

    #[test]
    fn test_apogee_sequence_progress() {
        let mut seq = ApogeeSequenceCmd::science(bus(), &CommandDefaults::default());
        assert_eq!(seq.sequence_string(), "ABBAABBA");
        seq.record_exposure();
        assert_eq!(seq.seq_done, 1);
        for _ in 0..4 {
            seq.record_exposure();
        }
        assert_eq!(seq.index, 5);
        assert_eq!(seq.seq_done, 2);
        seq.truncate_to_index();
        assert_eq!(seq.remaining(), 0);
        assert_eq!(
            seq.user_keys()[1],
            "doApogeeScience_sequenceState=\"ABBAA\",5"
        );
    }

    #[test]
    fn test_calibs_user_keys() {
        let mut calibs = DoCalibsCmd::new(bus(), CommandDefaults::default());
        calibs.n_arc = ExposureCount::new(2);
        calibs.n_arc.record_done();
        assert!(calibs.user_keys().contains(&"doCalibs_nArc=1,2".to_string()));
    }

    #[test]
    fn test_reinit_replaces_shared_state() {
        let states = CommandStates::new(bus(), CommandDefaults::default());
        let science = states.do_science.clone();
        write_cmd(&science).n_exp = ExposureCount::new(4);
        states.reinit();
        assert_eq!(read_cmd(&science).n_exp.total, 0);
        assert_eq!(states.snapshots(None).len(), CommandStates::NAMES.len());
        assert_eq!(states.snapshots(Some("doScience")).len(), 1);
    }
}
