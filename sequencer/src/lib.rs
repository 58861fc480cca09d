//! Observation sequencing for the spectroscopic survey telescope
//!
//! One worker task per device drains a priority mailbox; the master worker
//! runs the multi-step procedures (calibrations, science exposures, field
//! acquisition, telescope moves) one at a time, fanning device requests out
//! with [`coordinator::MultiCommand`]. [`actor::SopActor`] is the user-facing
//! surface: it validates and records a request, then queues it for the master.

pub mod actor;
pub mod bypass;
pub mod channel;
pub mod cmd_state;
pub mod config;
pub mod coordinator;
pub mod device_ops;
pub mod error;
pub mod event;
pub mod master;
pub mod message;
pub mod precondition;
pub mod procedures;
pub mod state;
pub mod status;
pub mod workers;

pub use actor::{
    classify_cartridge, ApogeeSequenceArgs, DitheredFlatArgs, DoCalibsArgs, DoScienceArgs, GotoFieldArgs,
    GotoGangChangeArgs, HartmannArgs, RestartArgs, SopActor, StatusArgs,
};
pub use bypass::Bypass;
pub use cmd_state::{CmdStateSnapshot, CommandStates, CommandStatus, StageState};
pub use config::SopConfig;
pub use device_ops::{DeviceOps, DeviceResult, SharedDeviceOps, SimulatedDeviceOps};
pub use error::{SopError, SopResult};
pub use event::{CommandHandle, EventBus, Severity, SopEvent};
pub use message::{Device, Survey};
pub use state::{SharedContext, SopContext};
pub use status::{Models, SharedStatus, StatusModel};
