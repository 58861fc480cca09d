//! Messages exchanged between the master task and the device workers

use crate::channel::Channel;
use crate::event::CommandHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One addressable subsystem, each driven by its own worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Device {
    Master,
    Ffs,
    FfLamp,
    HgCdLamp,
    NeLamp,
    UvLamp,
    WhtLamp,
    Boss,
    Guider,
    Tcc,
    Apogee,
    ApogeeScript,
}

impl Device {
    /// Every device that gets a worker, master first
    pub const ALL: [Device; 12] = [
        Device::Master,
        Device::Ffs,
        Device::FfLamp,
        Device::HgCdLamp,
        Device::NeLamp,
        Device::UvLamp,
        Device::WhtLamp,
        Device::Boss,
        Device::Guider,
        Device::Tcc,
        Device::Apogee,
        Device::ApogeeScript,
    ];

    /// The five calibration lamp banks
    pub const LAMPS: [Device; 5] = [
        Device::FfLamp,
        Device::HgCdLamp,
        Device::NeLamp,
        Device::WhtLamp,
        Device::UvLamp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Device::Master => "master",
            Device::Ffs => "ffs",
            Device::FfLamp => "ff",
            Device::HgCdLamp => "hgcd",
            Device::NeLamp => "ne",
            Device::UvLamp => "uv",
            Device::WhtLamp => "wht",
            Device::Boss => "boss",
            Device::Guider => "guider",
            Device::Tcc => "tcc",
            Device::Apogee => "apogee",
            Device::ApogeeScript => "apogeeScript",
        }
    }

    pub fn is_lamp(&self) -> bool {
        Self::LAMPS.contains(self)
    }

    /// Parse a worker name as used by `restart threads=...`
    pub fn from_name(name: &str) -> Option<Device> {
        Self::ALL.iter().copied().find(|d| d.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message priority. Lower discriminant is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical = 0,
    High = 2,
    Medium = 4,
    Normal = 6,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Exposure flavours understood by the cameras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureType {
    Bias,
    Dark,
    Flat,
    Arc,
    Science,
    Object,
    DomeFlat,
    /// Read out an exposure that was taken with `readout=false`
    Readout,
}

impl ExposureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureType::Bias => "bias",
            ExposureType::Dark => "dark",
            ExposureType::Flat => "flat",
            ExposureType::Arc => "arc",
            ExposureType::Science => "science",
            ExposureType::Object => "object",
            ExposureType::DomeFlat => "DomeFlat",
            ExposureType::Readout => "readout",
        }
    }

    /// "a" or "an", for user-facing progress text
    pub fn article(&self) -> &'static str {
        match self.as_str().chars().next() {
            Some('a' | 'e' | 'i' | 'o' | 'u') => "an",
            _ => "a",
        }
    }
}

impl fmt::Display for ExposureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which Hartmann screen is in the beam
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HartmannScreen {
    Left,
    Right,
}

impl HartmannScreen {
    pub fn as_str(&self) -> &'static str {
        match self {
            HartmannScreen::Left => "left",
            HartmannScreen::Right => "right",
        }
    }
}

/// BOSS spectrograph selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Spectrograph {
    Sp1,
    Sp2,
}

impl Spectrograph {
    pub const BOTH: [Spectrograph; 2] = [Spectrograph::Sp1, Spectrograph::Sp2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Spectrograph::Sp1 => "sp1",
            Spectrograph::Sp2 => "sp2",
        }
    }
}

/// One exposure request for a camera worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub exp_type: ExposureType,
    pub exp_time: f64,
    pub readout: bool,
    pub hartmann: Option<HartmannScreen>,
    pub spectrographs: Vec<Spectrograph>,
    /// APOGEE dither position, e.g. 'A'
    pub dither: Option<char>,
    pub comment: String,
    pub test: bool,
}

impl Exposure {
    pub fn new(exp_type: ExposureType, exp_time: f64) -> Self {
        Self {
            exp_type,
            exp_time,
            readout: true,
            hartmann: None,
            spectrographs: Vec::new(),
            dither: None,
            comment: String::new(),
            test: false,
        }
    }

    /// Read out the exposure left pending by a `readout=false` exposure
    pub fn pending_readout() -> Self {
        Self::new(ExposureType::Readout, 0.0)
    }

    pub fn without_readout(mut self) -> Self {
        self.readout = false;
        self
    }

    pub fn with_dither(mut self, dither: char) -> Self {
        self.dither = Some(dither);
        self
    }

    pub fn with_hartmann(mut self, screen: HartmannScreen) -> Self {
        self.hartmann = Some(screen);
        self
    }

    pub fn with_spectrographs(mut self, spectrographs: &[Spectrograph]) -> Self {
        self.spectrographs = spectrographs.to_vec();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn is_readout_only(&self) -> bool {
        self.exp_type == ExposureType::Readout
    }
}

/// Telescope slew destination
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SlewTarget {
    Sky { ra: f64, dec: f64, rot: f64, keep_offsets: bool },
    Mount { az: f64, alt: f64, rot: f64 },
}

/// Where the TCC should go for a position command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamedPosition {
    InstrumentChange,
    Stow,
}

impl NamedPosition {
    pub fn label(&self) -> &'static str {
        match self {
            NamedPosition::InstrumentChange => "instrument change",
            NamedPosition::Stow => "stow",
        }
    }
}

/// Plate family of the loaded cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Survey {
    Boss,
    Apogee,
    Unknown,
}

impl fmt::Display for Survey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Survey::Boss => "BOSS",
            Survey::Apogee => "APOGEE",
            Survey::Unknown => "UNKNOWN",
        })
    }
}

/// Payload of a message, one variant per kind
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Exit,
    Status,

    // Device operations
    Expose(Exposure),
    LampOn { on: bool, delay: Option<Duration> },
    FfsMove { open: bool },
    Slew(SlewTarget),
    WaitForSlewEnd { deadline: tokio::time::Instant },
    Hartmann,
    MoveCollimator { spectrograph: Spectrograph, a: i32, b: i32, c: i32 },
    StopExposure,
    ApogeeShutter { open: bool },
    ApogeeDomeFlat,
    GuiderStart { exp_time: f64, clear_corrections: bool },
    GuiderStop,

    // Master procedures
    DoCalibs { survey: Survey, cartridge: i32 },
    DoScience,
    DoApogeeExposures { exp_type: ExposureType, sky_flats: bool },
    DoApogeeDomeFlat,
    GotoField { survey: Survey },
    GotoGangChange { alt: f64, survey: Survey },
    GotoPosition(NamedPosition),
    DoHartmann { exp_time: f64, spectrographs: Vec<Spectrograph> },
    DitheredFlat { exp_time: f64, spectrographs: Vec<Spectrograph>, n_step: u32, n_tick: i32 },

    // Replies
    ExposureFinished { success: bool },
    Reply { success: bool, detail: Option<String> },
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Exit => "EXIT",
            MessageKind::Status => "STATUS",
            MessageKind::Expose(_) => "EXPOSE",
            MessageKind::LampOn { .. } => "LAMP_ON",
            MessageKind::FfsMove { .. } => "FFS_MOVE",
            MessageKind::Slew(_) => "SLEW",
            MessageKind::WaitForSlewEnd { .. } => "WAIT_FOR_SLEW_END",
            MessageKind::Hartmann => "HARTMANN",
            MessageKind::MoveCollimator { .. } => "MOVE_COLLIMATOR",
            MessageKind::StopExposure => "STOP_EXPOSURE",
            MessageKind::ApogeeShutter { .. } => "APOGEE_SHUTTER",
            MessageKind::ApogeeDomeFlat => "APOGEE_DOME_FLAT",
            MessageKind::GuiderStart { .. } => "GUIDER_START",
            MessageKind::GuiderStop => "GUIDER_STOP",
            MessageKind::DoCalibs { .. } => "DO_CALIBS",
            MessageKind::DoScience => "DO_SCIENCE",
            MessageKind::DoApogeeExposures { .. } => "DO_APOGEE_EXPOSURES",
            MessageKind::DoApogeeDomeFlat => "DO_APOGEE_DOME_FLAT",
            MessageKind::GotoField { .. } => "GOTO_FIELD",
            MessageKind::GotoGangChange { .. } => "GOTO_GANG_CHANGE",
            MessageKind::GotoPosition(_) => "GOTO_POSITION",
            MessageKind::DoHartmann { .. } => "DO_HARTMANN",
            MessageKind::DitheredFlat { .. } => "DITHERED_FLAT",
            MessageKind::ExposureFinished { .. } => "EXPOSURE_FINISHED",
            MessageKind::Reply { .. } => "REPLY",
        }
    }

    /// Success flag carried by a reply, if this is one
    pub fn reply_success(&self) -> Option<bool> {
        match self {
            MessageKind::Reply { success, .. } | MessageKind::ExposureFinished { success } => {
                Some(*success)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A message queued on a device channel
#[derive(Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub priority: Priority,
    /// User command this work is done for
    pub cmd: Option<CommandHandle>,
    pub reply_to: Option<Arc<Channel>>,
    pub sender: Option<Device>,
    /// Expected duration, annotated by the coordinator
    pub duration: Option<Duration>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            priority: Priority::Normal,
            cmd: None,
            reply_to: None,
            sender: None,
            duration: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_command(mut self, cmd: Option<CommandHandle>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn reply_to(mut self, channel: Arc<Channel>) -> Self {
        self.reply_to = Some(channel);
        self
    }

    pub fn from_device(mut self, sender: Device) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Build the reply to this message, sent by `sender`
    pub fn reply(&self, sender: Device, success: bool, detail: Option<String>) -> Message {
        Message::new(MessageKind::Reply { success, detail })
            .for_command(self.cmd.clone())
            .from_device(sender)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("sender", &self.sender)
            .field("reply_to", &self.reply_to.as_ref().map(|c| c.name().to_string()))
            .field("duration", &self.duration)
            .finish()
    }
}
