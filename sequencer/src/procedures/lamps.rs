use crate::coordinator::MultiCommand;
use crate::event::CommandHandle;
use crate::message::{Device, MessageKind};
use crate::state::SopContext;

/// Which lamps should be on, and where the flat-field screen should go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LampRequest {
    pub ff: bool,
    pub hgcd: bool,
    pub ne: bool,
    pub uv: bool,
    pub wht: bool,
    /// `None` leaves the screen alone
    pub open_ffs: Option<bool>,
}

impl LampRequest {
    pub fn all_off() -> Self {
        Self::default()
    }

    fn wants(&self, lamp: Device) -> bool {
        match lamp {
            Device::FfLamp => self.ff,
            Device::HgCdLamp => self.hgcd,
            Device::NeLamp => self.ne,
            Device::UvLamp => self.uv,
            Device::WhtLamp => self.wht,
            _ => false,
        }
    }
}

/// Switch every lamp bank (and optionally the screen) in one batch
///
/// Lamps are switched unconditionally and without waiting for warm-up.
pub async fn do_lamps(ctx: &SopContext, cmd: Option<CommandHandle>, request: LampRequest) -> bool {
    let mut batch = MultiCommand::new(ctx, cmd, ctx.config.timeout(), "lamps");
    for lamp in Device::LAMPS {
        batch.append(
            lamp,
            MessageKind::LampOn {
                on: request.wants(lamp),
                delay: None,
            },
        );
    }
    if let Some(open) = request.open_ffs {
        batch.append_with_timeout(
            Device::Ffs,
            MessageKind::FfsMove { open },
            ctx.config.timeout_plus(ctx.config.ffs_duration_secs),
        );
    }
    batch.run().await
}
