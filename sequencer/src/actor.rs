//! The user command surface
//!
//! [`SopActor`] owns the worker tasks and turns user requests into command
//! state updates plus one message to the master. A request that cannot be
//! honoured is refused before anything is queued: its handle is failed with
//! the reason and the same reason comes back as [`SopError::Rejected`].
//!
//! Repeating a command while it runs modifies it in place; the `abort` flag
//! stops it after its current activity.

use crate::bypass::Bypass;
use crate::channel::Channel;
use crate::cmd_state::{read_cmd, write_cmd, CommandStatus, ExposureCount, GotoFieldCmd, SopCommand, StageState};
use crate::error::{SopError, SopResult};
use crate::event::{CommandHandle, SopEvent};
use crate::message::{Device, ExposureType, Message, MessageKind, NamedPosition, Priority, Spectrograph, Survey};
use crate::procedures::{do_lamps, LampRequest};
use crate::state::{valid_commands_for, PlateInfo, SharedContext};
use crate::workers::{spawn_worker, WorkerHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const SKY_FLAT_COMMENT: &str = "sky flat, offset 0.01 degree in RA";
const SKY_FLAT_OFFSET_DEG: f64 = 0.01;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoCalibsArgs {
    pub abort: bool,
    pub n_bias: Option<u32>,
    pub n_dark: Option<u32>,
    pub n_flat: Option<u32>,
    pub n_arc: Option<u32>,
    pub dark_time: Option<f64>,
    pub flat_time: Option<f64>,
    pub arc_time: Option<f64>,
    pub guider_flat_time: Option<f64>,
    /// Mark the exposures as test quality
    pub test: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DoScienceArgs {
    /// `abort` or `stop`
    pub abort: bool,
    pub n_exp: Option<u32>,
    pub exp_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApogeeSequenceArgs {
    /// `abort` or `stop`
    pub abort: bool,
    pub exp_time: Option<f64>,
    pub dither_seq: Option<String>,
    /// Ignored for sky flats, which always run one sequence
    pub seq_count: Option<u32>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GotoFieldArgs {
    pub abort: bool,
    pub no_slew: bool,
    pub no_hartmann: bool,
    pub no_calibs: bool,
    pub no_guider: bool,
    pub keep_offsets: bool,
    pub arc_time: Option<f64>,
    pub flat_time: Option<f64>,
    pub guider_flat_time: Option<f64>,
    pub guider_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GotoGangChangeArgs {
    pub abort: bool,
    pub alt: Option<f64>,
}

/// Spectrograph selection plus exposure time, shared by hartmann and ditheredFlat
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HartmannArgs {
    pub exp_time: Option<f64>,
    pub sp1: bool,
    pub sp2: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DitheredFlatArgs {
    pub exp_time: Option<f64>,
    pub sp1: bool,
    pub sp2: bool,
    pub n_step: Option<u32>,
    pub n_tick: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusArgs {
    /// Also ask every worker for a STATUS reply
    pub threads: bool,
    /// Report only this command's keys
    pub one_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartArgs {
    /// Worker names; all workers when absent
    pub threads: Option<Vec<String>>,
    pub keep_queues: bool,
}

/// Survey a cartridge belongs to, and a warning when that is a guess or a lie
///
/// The plate bypasses override the cartridge number.
pub fn classify_cartridge(bypass: &Bypass, cartridge: i32) -> (Survey, Option<String>) {
    if bypass.get("brightPlate") {
        return (
            Survey::Boss,
            Some("We are lying about this being a Boss cartridge".to_string()),
        );
    }
    if bypass.get("darkPlate") {
        return (
            Survey::Apogee,
            Some("We are lying about this being a bright-time cartridge".to_string()),
        );
    }
    if cartridge <= 0 {
        return (
            Survey::Unknown,
            Some(format!("We do not have a valid cartridge (id={})", cartridge)),
        );
    }
    if (1..=9).contains(&cartridge) {
        (Survey::Apogee, None)
    } else {
        (Survey::Boss, None)
    }
}

fn spectrographs(sp1: bool, sp2: bool) -> Vec<Spectrograph> {
    match (sp1, sp2) {
        (true, false) => vec![Spectrograph::Sp1],
        (false, true) => vec![Spectrograph::Sp2],
        _ => Spectrograph::BOTH.to_vec(),
    }
}

fn reject(cmd: &CommandHandle, reason: impl Into<String>) -> SopError {
    let reason = reason.into();
    cmd.fail(reason.clone());
    SopError::Rejected(reason)
}

/// The sequencer as seen by its users
pub struct SopActor {
    ctx: SharedContext,
    workers: Mutex<HashMap<Device, WorkerHandle>>,
}

impl SopActor {
    /// Spawn every worker and configure for the current cartridge
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(ctx: SharedContext) -> SopResult<Self> {
        let mut workers = HashMap::new();
        for device in Device::ALL {
            workers.insert(device, spawn_worker(&ctx, device)?);
        }
        tracing::info!("sop started {} workers", workers.len());
        let actor = Self {
            ctx,
            workers: Mutex::new(workers),
        };
        actor.update_cartridge(actor.ctx.cartridge());
        Ok(actor)
    }

    pub fn context(&self) -> &SharedContext {
        &self.ctx
    }

    fn command(&self, name: &str) -> CommandHandle {
        CommandHandle::new(name, self.ctx.events.clone())
    }

    fn science_running(&self) -> bool {
        read_cmd(&self.ctx.commands.do_science).core().is_alive()
    }

    /// Hand a procedure to the master
    fn issue(&self, cmd: &CommandHandle, kind: MessageKind, state: Option<&str>) -> SopResult<()> {
        let msg = Message::new(kind).for_command(Some(cmd.clone()));
        if let Err(e) = self.ctx.send(Device::Master, msg) {
            tracing::error!("cannot issue {}: {}", cmd.name(), e);
            if let Some(state) = state {
                self.ctx.commands.with_command(state, |s| {
                    s.set_command_state(CommandStatus::Failed, Some("failed to issue command"))
                });
            }
            cmd.fail(format!("Failed to issue {}", cmd.name()));
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // BOSS
    // =========================================================================

    pub async fn do_calibs(&self, args: DoCalibsArgs) -> SopResult<CommandHandle> {
        let ctx = &self.ctx;
        let cmd = self.command("doCalibs");
        if self.science_running() {
            return Err(reject(
                &cmd,
                "a science exposure sequence is running -- will not take calibration frames!",
            ));
        }

        let state = &ctx.commands.do_calibs;
        let alive = read_cmd(state).core().is_alive();

        if args.abort {
            if !alive {
                return Err(reject(&cmd, "No doCalibs command is active"));
            }
            cmd.warn("doCalibs will abort when it finishes its current activities; be patient");
            {
                let mut calibs = write_cmd(state);
                calibs.clamp_to_done();
                calibs.core_mut().abort_stages();
            }
            self.finish_with_status(&cmd, Some("doCalibs"));
            return Ok(cmd);
        }

        if alive {
            {
                let mut calibs = write_cmd(state);
                if let Some(n) = args.n_arc {
                    calibs.n_arc.modify(n);
                }
                if let Some(n) = args.n_bias {
                    calibs.n_bias.modify(n);
                }
                if let Some(n) = args.n_dark {
                    calibs.n_dark.modify(n);
                }
                if let Some(n) = args.n_flat {
                    calibs.n_flat.modify(n);
                }
                if let Some(t) = args.arc_time {
                    calibs.arc_time = t;
                }
                if let Some(t) = args.dark_time {
                    calibs.dark_time = t;
                }
                if let Some(t) = args.flat_time {
                    calibs.flat_time = t;
                }
                if let Some(t) = args.guider_flat_time {
                    calibs.guider_flat_time = t;
                }
                calibs.test_exposures = args.test;
            }
            self.finish_with_status(&cmd, Some("doCalibs"));
            return Ok(cmd);
        }

        let plate = ctx.plate();
        if plate.survey != Survey::Boss {
            return Err(reject(
                &cmd,
                "current cartridge is not for BOSS; use bypass if you want to force calibrations",
            ));
        }

        let defaults = &ctx.config.defaults;
        let n_bias = args.n_bias.unwrap_or(0);
        let n_dark = args.n_dark.unwrap_or(0);
        let n_flat = args.n_flat.unwrap_or(0);
        let n_arc = args.n_arc.unwrap_or(0);
        let dark_time = args.dark_time.unwrap_or(0.0);
        if n_bias + n_dark + n_flat + n_arc == 0 {
            return Err(reject(&cmd, "You must take at least one arc, bias, dark, or flat exposure"));
        }
        if n_dark > 0 && dark_time <= 0.0 {
            return Err(reject(&cmd, "Please decide on a value for darkTime"));
        }

        let mut guider_flat_time = args.guider_flat_time.unwrap_or(0.0);
        if n_flat > 0 && guider_flat_time > 0.0 && plate.cartridge < 0 {
            cmd.warn("No cartridge is known to be loaded; not taking guider flats");
            guider_flat_time = 0.0;
        }

        {
            let mut calibs = write_cmd(state);
            calibs.reset_keywords();
            calibs.n_bias = ExposureCount::new(n_bias);
            calibs.n_dark = ExposureCount::new(n_dark);
            calibs.n_flat = ExposureCount::new(n_flat);
            calibs.n_arc = ExposureCount::new(n_arc);
            calibs.dark_time = dark_time;
            calibs.flat_time = args.flat_time.unwrap_or(defaults.flat_time);
            calibs.arc_time = args.arc_time.unwrap_or(defaults.arc_time);
            calibs.guider_flat_time = guider_flat_time;
            calibs.test_exposures = args.test;
            let active = calibs.active_stages();
            calibs.core_mut().setup_command(cmd.clone(), &active)?;
        }

        self.issue(
            &cmd,
            MessageKind::DoCalibs {
                survey: plate.survey,
                cartridge: plate.cartridge,
            },
            Some("doCalibs"),
        )?;
        Ok(cmd)
    }

    pub async fn do_science(&self, args: DoScienceArgs) -> SopResult<CommandHandle> {
        let ctx = &self.ctx;
        let cmd = self.command("doScience");
        let state = &ctx.commands.do_science;
        let alive = read_cmd(state).core().is_alive();

        if args.abort {
            if !alive {
                return Err(reject(&cmd, "No doScience command is active"));
            }
            cmd.warn("doScience will cancel pending exposures and stop and readout any running one.");
            {
                let mut science = write_cmd(state);
                science.core_mut().request_abort();
                science.n_exp.clamp_to_done();
            }
            if let Err(e) = ctx.ops.boss_stop_exposure(ctx.config.timeout()).await {
                tracing::warn!("doScience abort: {}", e);
                cmd.warn("Failed to stop running exposure");
            }
            write_cmd(state).core_mut().abort_stages();
            self.finish_with_status(&cmd, Some("doScience"));
            return Ok(cmd);
        }

        if alive {
            {
                let mut science = write_cmd(state);
                if let Some(n) = args.n_exp {
                    science.n_exp.modify(n);
                }
                if let Some(t) = args.exp_time {
                    science.exp_time = t;
                }
            }
            self.finish_with_status(&cmd, Some("doScience"));
            return Ok(cmd);
        }

        let n_exp = args.n_exp.unwrap_or(ctx.config.defaults.science_nexp);
        if n_exp == 0 {
            return Err(reject(&cmd, "You must take at least one exposure"));
        }
        {
            let mut science = write_cmd(state);
            science.reset_keywords();
            science.n_exp = ExposureCount::new(n_exp);
            science.exp_time = args.exp_time.unwrap_or(ctx.config.defaults.science_exp_time);
            science.core_mut().setup_command(cmd.clone(), &["expose"])?;
        }
        self.issue(&cmd, MessageKind::DoScience, Some("doScience"))?;
        Ok(cmd)
    }

    pub async fn hartmann(&self, args: HartmannArgs) -> SopResult<CommandHandle> {
        let cmd = self.command("hartmann");
        if self.science_running() {
            return Err(reject(
                &cmd,
                "a science exposure sequence is running -- will not start a hartmann sequence!",
            ));
        }
        let kind = MessageKind::DoHartmann {
            exp_time: args.exp_time.unwrap_or(self.ctx.config.defaults.arc_time),
            spectrographs: spectrographs(args.sp1, args.sp2),
        };
        self.issue(&cmd, kind, None)?;
        Ok(cmd)
    }

    pub async fn dithered_flat(&self, args: DitheredFlatArgs) -> SopResult<CommandHandle> {
        let cmd = self.command("ditheredFlat");
        if self.science_running() {
            return Err(reject(
                &cmd,
                "a science exposure sequence is running -- will not start dithered flats!",
            ));
        }
        let defaults = &self.ctx.config.defaults;
        let kind = MessageKind::DitheredFlat {
            exp_time: args.exp_time.unwrap_or(defaults.dithered_flat_exp_time),
            spectrographs: spectrographs(args.sp1, args.sp2),
            n_step: args.n_step.unwrap_or(defaults.dithered_flat_n_step),
            n_tick: args.n_tick.unwrap_or(defaults.dithered_flat_n_tick),
        };
        self.issue(&cmd, kind, None)?;
        Ok(cmd)
    }

    // =========================================================================
    // APOGEE
    // =========================================================================

    /// Cancel what is left of a running APOGEE sequence and stop the exposure
    async fn stop_apogee_sequence(&self, cmd: &CommandHandle, sky_flats: bool) -> SopResult<()> {
        let ctx = &self.ctx;
        let (state, name) = if sky_flats {
            (&ctx.commands.do_apogee_sky_flats, "doApogeeSkyFlats")
        } else {
            (&ctx.commands.do_apogee_science, "doApogeeScience")
        };
        if !read_cmd(state).core().is_alive() {
            return Err(reject(cmd, format!("No {} command is active", name)));
        }
        cmd.warn(format!("{} will cancel pending exposures and stop any running one.", name));
        {
            let mut seq = write_cmd(state);
            seq.core_mut().request_abort();
            seq.truncate_to_index();
        }
        if let Err(e) = ctx.ops.apogee_stop_exposure(ctx.config.timeout()).await {
            tracing::warn!("{} stop: {}", name, e);
            cmd.warn("Failed to stop running exposure");
        }
        write_cmd(state).core_mut().abort_stages();
        self.finish_with_status(cmd, Some(name));
        Ok(())
    }

    pub async fn do_apogee_science(&self, args: ApogeeSequenceArgs) -> SopResult<CommandHandle> {
        let ctx = &self.ctx;
        let cmd = self.command("doApogeeScience");

        if args.abort {
            self.stop_apogee_sequence(&cmd, false).await?;
            return Ok(cmd);
        }

        let state = &ctx.commands.do_apogee_science;
        if read_cmd(state).core().is_alive() {
            {
                let mut seq = write_cmd(state);
                if let Some(dither_seq) = &args.dither_seq {
                    if seq.seq_count > 1 && *dither_seq != seq.dither_seq {
                        cmd.warn(
                            "If you are certain it makes sense to change the dither sequence, change Seq Count to 1 first.",
                        );
                        return Err(reject(
                            &cmd,
                            "Cannot modify dither sequence if current sequence count is > 1.",
                        ));
                    }
                    seq.dither_seq = dither_seq.clone();
                }
                if let Some(seq_count) = args.seq_count {
                    seq.seq_count = seq_count;
                }
                if let Some(exp_time) = args.exp_time {
                    seq.exp_time = exp_time;
                }
                seq.rebuild_sequence();
                if seq.index >= seq.exposure_seq.len() {
                    cmd.warn("Modified exposure sequence is shorter than position in current sequence.");
                    cmd.warn("Truncating previous exposure sequence, but NOT trying to stop current exposure.");
                    seq.index = seq.exposure_seq.len();
                }
            }
            self.finish_with_status(&cmd, Some("doApogeeScience"));
            return Ok(cmd);
        }

        let defaults = &ctx.config.defaults;
        let dither_seq = args.dither_seq.unwrap_or_else(|| defaults.apogee_dither_seq.clone());
        let seq_count = args.seq_count.unwrap_or(defaults.apogee_seq_count);
        if dither_seq.is_empty() || seq_count == 0 {
            return Err(reject(&cmd, "You must take at least one exposure"));
        }
        {
            let mut seq = write_cmd(state);
            seq.reset_keywords();
            seq.exp_time = args.exp_time.unwrap_or(defaults.apogee_exp_time);
            seq.dither_seq = dither_seq;
            seq.seq_count = seq_count;
            seq.comment = args.comment.unwrap_or_default();
            seq.rebuild_sequence();
            seq.core_mut().setup_command(cmd.clone(), &["expose"])?;
        }
        cmd.diag("Issuing doApogeeScience");
        self.issue(
            &cmd,
            MessageKind::DoApogeeExposures {
                exp_type: ExposureType::Object,
                sky_flats: false,
            },
            Some("doApogeeScience"),
        )?;
        Ok(cmd)
    }

    /// Sky flats: one dither sequence taken just off the field, unguided
    pub async fn do_apogee_sky_flats(&self, args: ApogeeSequenceArgs) -> SopResult<CommandHandle> {
        let ctx = &self.ctx;
        let cmd = self.command("doApogeeSkyFlats");

        if args.abort {
            self.stop_apogee_sequence(&cmd, true).await?;
            return Ok(cmd);
        }

        let state = &ctx.commands.do_apogee_sky_flats;
        if read_cmd(state).core().is_alive() {
            return Err(reject(&cmd, "doApogeeSkyFlats is already running"));
        }
        let dither_seq = args
            .dither_seq
            .unwrap_or_else(|| ctx.config.defaults.apogee_dither_seq.clone());
        if dither_seq.is_empty() {
            return Err(reject(&cmd, "You must take at least one exposure"));
        }

        if let Err(e) = ctx.ops.guider_stop(ctx.config.timeout()).await {
            tracing::warn!("sky flats: {}", e);
            return Err(reject(&cmd, "Failed to turn off guiding for sky flats."));
        }
        if let Err(e) = ctx.ops.tcc_offset(SKY_FLAT_OFFSET_DEG, 0.0, ctx.config.timeout()).await {
            tracing::warn!("sky flats: {}", e);
            return Err(reject(&cmd, "Failed to take offset for sky flats."));
        }

        {
            let mut seq = write_cmd(state);
            seq.reset_keywords();
            seq.exp_time = args.exp_time.unwrap_or(ctx.config.defaults.sky_flat_exp_time);
            seq.dither_seq = dither_seq;
            seq.seq_count = 1;
            seq.comment = SKY_FLAT_COMMENT.to_string();
            seq.rebuild_sequence();
            seq.core_mut().setup_command(cmd.clone(), &["expose"])?;
        }
        cmd.diag("Issuing doApogeeSkyFlats");
        self.issue(
            &cmd,
            MessageKind::DoApogeeExposures {
                exp_type: ExposureType::Object,
                sky_flats: true,
            },
            Some("doApogeeSkyFlats"),
        )?;
        Ok(cmd)
    }

    pub async fn do_apogee_dome_flat(&self) -> SopResult<CommandHandle> {
        let cmd = self.command("doApogeeDomeFlat");
        let state = &self.ctx.commands.do_apogee_dome_flat;
        {
            let mut dome = write_cmd(state);
            if dome.core().is_alive() {
                return Err(reject(&cmd, "doApogeeDomeFlat is already running"));
            }
            dome.core_mut().setup_command(cmd.clone(), &["domeFlat"])?;
        }
        self.issue(&cmd, MessageKind::DoApogeeDomeFlat, Some("doApogeeDomeFlat"))?;
        Ok(cmd)
    }

    // =========================================================================
    // Telescope
    // =========================================================================

    pub async fn goto_field(&self, args: GotoFieldArgs) -> SopResult<CommandHandle> {
        let ctx = &self.ctx;
        let cmd = self.command("gotoField");
        if self.science_running() {
            return Err(reject(&cmd, "a science exposure sequence is running -- will not go to field!"));
        }

        let state = &ctx.commands.goto_field;
        let alive = read_cmd(state).core().is_alive();
        let survey = ctx.survey();

        if args.abort {
            if !alive {
                return Err(reject(&cmd, "No gotoField command is active"));
            }
            write_cmd(state).core_mut().request_abort();
            if let Err(e) = ctx.ops.tcc_axis_stop(ctx.config.timeout()).await {
                tracing::warn!("gotoField abort: {}", e);
                cmd.warn("Failed to abort slew");
            }
            {
                let mut field = write_cmd(state);
                field.clamp_to_done();
                field.core_mut().abort_stages();
            }
            cmd.warn("gotoField will abort when it finishes its current activities; be patient");
            self.finish_with_status(&cmd, Some("gotoField"));
            return Ok(cmd);
        }

        if alive {
            modify_goto_field(&mut write_cmd(state), &args, survey, &cmd)?;
            self.finish_with_status(&cmd, Some("gotoField"));
            return Ok(cmd);
        }

        let models = ctx.status.snapshot();
        let defaults = &ctx.config.defaults;
        let do_slew = !args.no_slew;
        let pointing = models.pointing;
        if do_slew && pointing.is_none() && !ctx.bypass.get("slewToField") {
            return Err(reject(&cmd, "No plate pointing is known; cannot slew to field"));
        }

        let mut field = write_cmd(state);
        field.reset_keywords();
        field.do_slew = do_slew;
        field.do_guider = !args.no_guider;
        field.do_hartmann = survey == Survey::Boss && !args.no_hartmann;
        field.arc_time = args.arc_time.unwrap_or(defaults.arc_time);
        field.flat_time = args.flat_time.unwrap_or(defaults.flat_time);
        field.guider_flat_time = args.guider_flat_time.unwrap_or(defaults.guider_flat_time);
        field.guider_time = args.guider_time.unwrap_or(defaults.guider_time);
        field.keep_offsets = args.keep_offsets;

        let calibs_allowed = !args.no_calibs && survey == Survey::Boss;
        let n_arc = u32::from(calibs_allowed && field.arc_time != 0.0);
        let n_flat = u32::from(calibs_allowed && field.flat_time != 0.0);
        field.n_arc = ExposureCount::new(n_arc);
        field.n_flat = ExposureCount::new(n_flat);

        let wants_guider_flat = field.do_guider && field.guider_flat_time > 0.0;
        field.do_guider_flat = if survey == Survey::Boss || !wants_guider_flat {
            wants_guider_flat
        } else if !models.gang_at_cartridge(&ctx.bypass) {
            true
        } else if matches!(models.apogee_shutter, Some((false, true))) {
            true
        } else {
            cmd.warn(
                "skipping guider flat because APOGEE gang connector is not on the podium _and_ the cold shutter is open.",
            );
            false
        };
        if survey == Survey::Unknown {
            cmd.warn("No cartridge is known to be loaded; disabling guider");
            field.do_guider = false;
        }

        let pointing = pointing.unwrap_or(crate::status::Pointing { ra: 0.0, dec: 0.0 });
        field.ra = pointing.ra;
        field.dec = pointing.dec;
        field.rotang = 0.0;

        let active = field.active_stages();
        field.core_mut().setup_command(cmd.clone(), &active)?;
        drop(field);

        self.issue(&cmd, MessageKind::GotoField { survey }, Some("gotoField"))?;
        Ok(cmd)
    }

    /// Position gotoField slews to while the `slewToField` bypass is set
    ///
    /// A missing az or alt means "where the telescope is".
    pub fn set_fake_field(&self, az: Option<f64>, alt: Option<f64>, rot_offset: Option<f64>) -> CommandHandle {
        let cmd = self.command("setFakeField");
        let mut field = write_cmd(&self.ctx.commands.goto_field);
        field.fake_az = az;
        field.fake_alt = alt;
        field.fake_rot_offset = rot_offset.unwrap_or(0.0);
        let show = |v: Option<f64>| v.map_or_else(|| "None".to_string(), |v| v.to_string());
        cmd.finish(format!(
            "set fake slew position to az={} alt={} rotOffset={}",
            show(field.fake_az),
            show(field.fake_alt),
            field.fake_rot_offset
        ));
        cmd
    }

    /// Why the telescope must not move now, if it must not
    pub fn is_slewing_disabled(&self) -> Option<String> {
        let commands = &self.ctx.commands;
        match self.ctx.survey() {
            Survey::Boss => {
                let science = read_cmd(&commands.do_science);
                if !science.core().is_alive() {
                    return None;
                }
                let exposure_state = self.ctx.status.snapshot().boss_exposure_state;
                if science.n_exp.left <= 1 && exposure_state.allows_slew() {
                    return None;
                }
                Some(format!(
                    "slewing disallowed for BOSS, with {} science exposures left; exposureState={}",
                    science.n_exp.left,
                    exposure_state.as_str()
                ))
            }
            _ => read_cmd(&commands.do_apogee_science)
                .core()
                .is_alive()
                .then(|| "slewing disallowed for APOGEE, blocked by active doApogeeScience sequence".to_string()),
        }
    }

    async fn goto_named_position(&self, position: NamedPosition) -> SopResult<CommandHandle> {
        let (name, state) = match position {
            NamedPosition::InstrumentChange => ("gotoInstrumentChange", &self.ctx.commands.goto_instrument_change),
            NamedPosition::Stow => ("gotoStow", &self.ctx.commands.goto_stow),
        };
        let cmd = self.command(name);
        if let Some(blocked) = self.is_slewing_disabled() {
            return Err(reject(
                &cmd,
                format!("will not go to {} position: {}", position.label(), blocked),
            ));
        }
        write_cmd(state).core_mut().setup_command(cmd.clone(), &["slew"])?;
        self.issue(&cmd, MessageKind::GotoPosition(position), Some(name))?;
        Ok(cmd)
    }

    pub async fn goto_instrument_change(&self) -> SopResult<CommandHandle> {
        self.goto_named_position(NamedPosition::InstrumentChange).await
    }

    pub async fn goto_stow(&self) -> SopResult<CommandHandle> {
        self.goto_named_position(NamedPosition::Stow).await
    }

    pub async fn goto_gang_change(&self, args: GotoGangChangeArgs) -> SopResult<CommandHandle> {
        let cmd = self.command("gotoGangChange");
        if let Some(blocked) = self.is_slewing_disabled() {
            return Err(reject(&cmd, format!("will not go to gang change: {}", blocked)));
        }
        let state = &self.ctx.commands.goto_gang_change;
        let alt = args.alt.unwrap_or(self.ctx.config.defaults.gang_change_alt);
        write_cmd(state).alt = alt;

        if args.abort {
            return Err(reject(&cmd, "sorry, I cannot stop or abort a gotoGangChange command. (yet)"));
        }
        write_cmd(state).core_mut().setup_command(cmd.clone(), &["slew"])?;
        self.issue(
            &cmd,
            MessageKind::GotoGangChange {
                alt,
                survey: self.ctx.survey(),
            },
            Some("gotoGangChange"),
        )?;
        Ok(cmd)
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Turn every lamp off, inline
    pub async fn lamps_off(&self) -> CommandHandle {
        let cmd = self.command("lampsOff");
        if do_lamps(&self.ctx, Some(cmd.clone()), LampRequest::all_off()).await {
            cmd.finish("Turned lamps off");
        } else {
            cmd.fail("Some lamps failed to turn off");
        }
        cmd
    }

    /// Set or clear bypasses; the partner of an exclusive pair is cleared
    pub async fn bypass(&self, subsystems: &[&str], clear: bool) -> SopResult<CommandHandle> {
        let cmd = self.command("bypass");
        for name in subsystems {
            let cleared = match self.ctx.bypass.set(name, !clear) {
                Ok(cleared) => cleared,
                Err(e) => {
                    cmd.fail(e.to_string());
                    return Err(e);
                }
            };
            self.ctx.events.publish(SopEvent::BypassChanged {
                name: name.to_string(),
                bypassed: !clear,
            });
            if let Some(partner) = cleared {
                self.ctx.events.publish(SopEvent::BypassChanged {
                    name: partner.to_string(),
                    bypassed: false,
                });
            }

            match *name {
                "darkPlate" | "brightPlate" => self.update_cartridge(self.ctx.cartridge()),
                "gangPodium" | "gangCart" => cmd.warn(format!("gang bypass: {}", self.gang_position())),
                _ => {}
            }
        }
        self.finish_with_status(&cmd, None);
        Ok(cmd)
    }

    fn gang_position(&self) -> String {
        let models = self.ctx.status.snapshot();
        format!(
            "{:?} (at cartridge: {})",
            models.gang,
            models.gang_at_cartridge(&self.ctx.bypass)
        )
    }

    /// Adopt a newly loaded cartridge
    pub fn update_cartridge(&self, cartridge: i32) {
        let bcast = self.command("loadCartridge");
        let (survey, warning) = classify_cartridge(&self.ctx.bypass, cartridge);
        if let Some(warning) = warning {
            bcast.warn(warning);
        }
        bcast.warn(format!("loadCartridge fired cart={} survey={}", cartridge, survey));

        self.ctx.set_plate(PlateInfo {
            cartridge,
            survey,
            valid_commands: valid_commands_for(survey),
        });
        write_cmd(&self.ctx.commands.goto_field)
            .core_mut()
            .set_stages(GotoFieldCmd::stages_for(survey));
        self.status_keys(&bcast, None);
    }

    /// Bypasses, valid commands and command states; with `threads`, also
    /// checks that every worker answers
    pub async fn status(&self, args: StatusArgs) -> CommandHandle {
        let cmd = self.command("status");
        self.status_keys(&cmd, args.one_command.as_deref());

        if args.threads {
            let mut batch = crate::coordinator::MultiCommand::new(
                &self.ctx,
                Some(cmd.clone()),
                self.ctx.config.status_timeout(),
                "status",
            );
            for device in Device::ALL {
                batch.append(device, MessageKind::Status);
            }
            if !batch.run().await {
                cmd.fail("");
                return cmd;
            }
        }
        cmd.finish("");
        cmd
    }

    fn status_keys(&self, cmd: &CommandHandle, only: Option<&str>) {
        let entries = self.ctx.bypass.entries();
        let names: Vec<String> = entries.iter().map(|(name, _)| format!("\"{}\"", name)).collect();
        let states: Vec<&str> = entries.iter().map(|(_, on)| if *on { "1" } else { "0" }).collect();
        let bypassed: Vec<String> = self
            .ctx
            .bypass
            .bypassed_names()
            .iter()
            .map(|name| format!("\"{}\"", name))
            .collect();
        cmd.inform(format!("bypassNames={}", names.join(", ")));
        cmd.inform(format!("bypassed={}", states.join(", ")));
        cmd.inform(format!("bypassedNames={}", bypassed.join(", ")));
        cmd.inform(format!("surveyCommands={}", self.ctx.plate().valid_commands.join(", ")));

        for snapshot in self.ctx.commands.snapshots(only) {
            self.ctx.events.publish(SopEvent::CommandState(snapshot));
        }
        cmd.inform(format!("apogeeGang: {}", self.gang_position()));
    }

    fn finish_with_status(&self, cmd: &CommandHandle, only: Option<&str>) {
        self.status_keys(cmd, only);
        cmd.finish("");
    }

    pub fn ping(&self) -> CommandHandle {
        let cmd = self.command("ping");
        cmd.finish("Yawn; how soporific");
        cmd
    }

    /// Recreate every command state
    pub fn reinit(&self) -> CommandHandle {
        let cmd = self.command("reinit");
        cmd.inform("recreating command objects");
        self.ctx.commands.reinit();
        self.update_cartridge(self.ctx.cartridge());
        cmd.finish("");
        cmd
    }

    /// Replace worker tasks, and their mailboxes unless `keep_queues`
    pub async fn restart(&self, args: RestartArgs) -> SopResult<CommandHandle> {
        let cmd = self.command("restart");
        let devices = match &args.threads {
            None => Device::ALL.to_vec(),
            Some(names) => {
                let mut devices = Vec::with_capacity(names.len());
                for name in names {
                    match Device::from_name(name) {
                        Some(device) => devices.push(device),
                        None => return Err(reject(&cmd, format!("unknown thread: {}", name))),
                    }
                }
                devices
            }
        };

        cmd.inform("Restarting threads");
        for device in devices {
            self.stop_worker(Some(&cmd), device).await;
            if !args.keep_queues {
                let fresh = Arc::new(Channel::new(device.name()));
                if let Some(old) = self.ctx.replace_queue(device, fresh) {
                    old.close();
                    let discarded = old.drain();
                    if discarded > 0 {
                        tracing::info!("restart: discarded {} queued messages for {}", discarded, device);
                    }
                }
            }
            let handle = match spawn_worker(&self.ctx, device) {
                Ok(handle) => handle,
                Err(e) => {
                    cmd.fail(format!("failed to restart {}: {}", device, e));
                    return Err(e);
                }
            };
            self.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device, handle);
        }
        cmd.finish("secundum verbum tuum in pace");
        Ok(cmd)
    }

    /// Ask a worker to exit; abort it if it does not within the status timeout
    async fn stop_worker(&self, cmd: Option<&CommandHandle>, device: Device) {
        let handle = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device);
        let Some(mut handle) = handle else {
            return;
        };

        let exit = Message::new(MessageKind::Exit)
            .with_priority(Priority::Critical)
            .for_command(cmd.cloned());
        if let Err(e) = self.ctx.send(device, exit) {
            tracing::warn!("cannot ask {} to exit: {}", device, e);
        }
        if tokio::time::timeout(self.ctx.config.status_timeout(), &mut handle.join)
            .await
            .is_err()
        {
            tracing::warn!("{} worker did not exit; aborting it", handle.device);
            handle.join.abort();
        }
    }

    /// Stop every worker
    pub async fn shutdown(&self) {
        for device in Device::ALL {
            self.stop_worker(None, device).await;
        }
        tracing::info!("sop workers stopped");
    }
}

/// Apply a repeated gotoField to the running one
///
/// Stages that have not started follow the new flags; calibrations already
/// taken cannot be changed.
fn modify_goto_field(
    field: &mut GotoFieldCmd,
    args: &GotoFieldArgs,
    survey: Survey,
    cmd: &CommandHandle,
) -> SopResult<()> {
    field.do_slew = !args.no_slew;
    field.do_guider = !args.no_guider;
    field.do_hartmann = survey == Survey::Boss && !args.no_hartmann;

    let mut drop_calibs = false;
    if args.no_calibs {
        if field.n_arc.done > 0 || field.n_flat.done > 0 {
            cmd.warn("Some cals have been taken; it's too late to disable them.");
        } else {
            drop_calibs = true;
        }
    }
    if args.arc_time.is_some() || drop_calibs {
        if field.n_arc.done > 0 {
            cmd.warn("Arcs are taken; it's too late to modify arcTime");
        } else {
            field.arc_time = args.arc_time.unwrap_or(field.arc_time);
            field.n_arc = ExposureCount::new(u32::from(!drop_calibs && field.arc_time > 0.0));
        }
    }
    if args.flat_time.is_some() || drop_calibs {
        if field.n_flat.done > 0 {
            cmd.warn("Flats are taken; it's too late to modify flatTime");
        } else {
            field.flat_time = args.flat_time.unwrap_or(field.flat_time);
            field.n_flat = ExposureCount::new(u32::from(!drop_calibs && field.flat_time > 0.0));
        }
    }
    if let Some(t) = args.guider_flat_time {
        field.guider_flat_time = t;
    }
    if let Some(t) = args.guider_time {
        field.guider_time = t;
    }

    let wanted = [
        ("slew", field.do_slew),
        ("hartmann", field.do_hartmann),
        ("calibs", field.do_calibs()),
        ("guider", field.do_guider),
    ];
    for (stage, on) in wanted {
        let not_started = matches!(
            field.core().stage(stage),
            Some(StageState::Pending | StageState::Off | StageState::Idle)
        );
        if not_started {
            field.core_mut().set_stage_active(stage, on)?;
        }
    }
    Ok(())
}
