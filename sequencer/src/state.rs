//! Process-wide sequencer context
//!
//! One [`SopContext`] is created per actor and shared by the user surface,
//! the master task and every worker. It replaces what would otherwise be
//! global state: configuration, the device status model, bypasses, command
//! states, the worker mailboxes and the loaded plate.

use crate::bypass::Bypass;
use crate::channel::Channel;
use crate::cmd_state::CommandStates;
use crate::config::SopConfig;
use crate::device_ops::SharedDeviceOps;
use crate::error::{SopError, SopResult};
use crate::event::EventBus;
use crate::message::{Device, Message, Survey};
use crate::status::SharedStatus;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, PoisonError};

/// The loaded cartridge and what it allows
#[derive(Debug, Clone, PartialEq)]
pub struct PlateInfo {
    pub cartridge: i32,
    pub survey: Survey,
    pub valid_commands: Vec<&'static str>,
}

impl Default for PlateInfo {
    fn default() -> Self {
        Self {
            cartridge: -1,
            survey: Survey::Unknown,
            valid_commands: valid_commands_for(Survey::Unknown),
        }
    }
}

/// User commands that make sense for a survey
pub fn valid_commands_for(survey: Survey) -> Vec<&'static str> {
    match survey {
        Survey::Boss => vec![
            "gotoField",
            "hartmann",
            "doCalibs",
            "doScience",
            "gotoInstrumentChange",
        ],
        Survey::Apogee => vec![
            "gotoField",
            "doApogeeScience",
            "doApogeeSkyFlats",
            "gotoGangChange",
            "gotoInstrumentChange",
            "doApogeeDomeFlat",
        ],
        Survey::Unknown => vec!["gotoStow", "gotoInstrumentChange"],
    }
}

pub struct SopContext {
    pub config: SopConfig,
    pub status: SharedStatus,
    pub bypass: Bypass,
    pub events: EventBus,
    pub commands: CommandStates,
    pub ops: SharedDeviceOps,
    queues: StdRwLock<HashMap<Device, Arc<Channel>>>,
    plate: StdRwLock<PlateInfo>,
}

pub type SharedContext = Arc<SopContext>;

impl SopContext {
    pub fn new(config: SopConfig, status: SharedStatus, ops: SharedDeviceOps, events: EventBus) -> Self {
        let commands = CommandStates::new(events.clone(), config.defaults.clone());
        let queues = Device::ALL
            .iter()
            .map(|device| (*device, Arc::new(Channel::new(device.name()))))
            .collect();
        Self {
            config,
            status,
            bypass: Bypass::new(),
            events,
            commands,
            ops,
            queues: StdRwLock::new(queues),
            plate: StdRwLock::new(PlateInfo::default()),
        }
    }

    /// Mailbox of a device worker
    pub fn queue(&self, device: Device) -> SopResult<Arc<Channel>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .cloned()
            .ok_or(SopError::ChannelUnavailable(device))
    }

    /// Install a new mailbox for a device, returning the one it replaces
    pub fn replace_queue(&self, device: Device, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, channel)
    }

    pub fn send(&self, device: Device, msg: Message) -> SopResult<()> {
        self.queue(device)?.send(msg)
    }

    pub fn plate(&self) -> PlateInfo {
        self.plate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn survey(&self) -> Survey {
        self.plate().survey
    }

    pub fn cartridge(&self) -> i32 {
        self.plate().cartridge
    }

    pub fn set_plate(&self, plate: PlateInfo) {
        *self.plate.write().unwrap_or_else(PoisonError::into_inner) = plate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::SimulatedDeviceOps;
    use crate::message::MessageKind;
    use crate::status::{Models, StatusModel};
    use tokio::time::Instant;

    fn context() -> SopContext {
        let status = Arc::new(StatusModel::new(Models::quiescent(Instant::now())));
        let ops = Arc::new(SimulatedDeviceOps::new(status.clone()));
        SopContext::new(SopConfig::default(), status, ops, EventBus::default())
    }

    #[test]
    fn test_every_device_has_a_queue() {
        let ctx = context();
        for device in Device::ALL {
            assert_eq!(ctx.queue(device).unwrap().name(), device.name());
        }
        ctx.send(Device::Boss, Message::new(MessageKind::Status)).unwrap();
        assert_eq!(ctx.queue(Device::Boss).unwrap().len(), 1);
    }

    #[test]
    fn test_replace_queue_returns_old() {
        let ctx = context();
        let old = ctx
            .replace_queue(Device::Tcc, Arc::new(Channel::new("tcc")))
            .unwrap();
        old.send(Message::new(MessageKind::Status)).unwrap();
        assert!(ctx.queue(Device::Tcc).unwrap().is_empty());
    }

    #[test]
    fn test_default_plate_is_unknown() {
        let ctx = context();
        assert_eq!(ctx.survey(), Survey::Unknown);
        assert_eq!(ctx.cartridge(), -1);
        assert!(ctx.plate().valid_commands.contains(&"gotoStow"));
    }
}
