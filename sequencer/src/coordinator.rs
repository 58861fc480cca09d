//! Fan-out/fan-in batches of device messages
//!
//! A [`MultiCommand`] collects messages for several workers, submits them
//! all at once with a private reply channel, then counts replies on that
//! channel. The batch succeeds only if every submitted message is answered
//! with success before its receive times out. Preconditions that are already
//! satisfied are dropped before submission and are not waited for.

use crate::channel::{Channel, Received};
use crate::config::{secs_to_duration, SopConfig};
use crate::event::CommandHandle;
use crate::message::{Device, Message, MessageKind, Priority};
use crate::precondition::Precondition;
use crate::state::SopContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

enum Entry {
    Direct { device: Device, kind: MessageKind },
    Conditional(Precondition),
}

/// Expected duration of a device operation, used as its time limit
pub fn expected_duration(config: &SopConfig, device: Device, kind: &MessageKind) -> Option<Duration> {
    let secs = match (device, kind) {
        (Device::Ffs, MessageKind::FfsMove { .. }) => config.ffs_duration_secs,
        (Device::Guider, MessageKind::Expose(exposure)) => exposure.exp_time + config.guider_readout_secs,
        (Device::Boss, MessageKind::Expose(exposure)) => {
            if exposure.is_readout_only() {
                config.readout_duration_secs
            } else {
                let mut secs = 0.0;
                if exposure.exp_time >= 0.0 {
                    secs += config.flush_duration_secs + exposure.exp_time;
                }
                if exposure.readout {
                    secs += config.readout_duration_secs;
                }
                secs
            }
        }
        (Device::Boss, MessageKind::Hartmann) => config.hartmann_duration_secs,
        _ => return None,
    };
    Some(secs_to_duration(secs))
}

/// A batch being assembled
pub struct MultiCommand<'a> {
    ctx: &'a SopContext,
    cmd: Option<CommandHandle>,
    timeout: Duration,
    label: String,
    entries: Vec<Entry>,
}

impl<'a> MultiCommand<'a> {
    pub fn new(
        ctx: &'a SopContext,
        cmd: Option<CommandHandle>,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            cmd,
            timeout,
            label: label.into(),
            entries: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raise_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(timeout) = timeout {
            if timeout > self.timeout {
                self.timeout = timeout;
            }
        }
    }

    pub fn append(&mut self, device: Device, kind: MessageKind) -> &mut Self {
        self.entries.push(Entry::Direct { device, kind });
        self
    }

    /// Append, raising the batch timeout to `timeout` if that is longer
    pub fn append_with_timeout(&mut self, device: Device, kind: MessageKind, timeout: Duration) -> &mut Self {
        self.raise_timeout(Some(timeout));
        self.append(device, kind)
    }

    pub fn append_precondition(&mut self, precondition: Precondition) -> &mut Self {
        self.raise_timeout(precondition.timeout);
        self.entries.push(Entry::Conditional(precondition));
        self
    }

    fn build(&self, reply: &Arc<Channel>, kind: MessageKind, device: Device) -> Message {
        let mut msg = Message::new(kind)
            .for_command(self.cmd.clone())
            .reply_to(reply.clone())
            .from_device(Device::Master);
        msg.duration = expected_duration(&self.ctx.config, device, &msg.kind);
        msg
    }

    /// Evaluate preconditions and submit; the replies are collected by
    /// [`PendingBatch::finish`]
    pub fn start(mut self) -> PendingBatch {
        let reply = Arc::new(Channel::new(format!("{} replies", self.label)));
        let models = self.ctx.status.snapshot();
        let now = Instant::now();

        let entries = std::mem::take(&mut self.entries);
        let mut outgoing = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Entry::Direct { device, kind } => outgoing.push((device, kind)),
                Entry::Conditional(mut precondition) => {
                    match precondition.required(&models, &self.ctx.config.warmup, now) {
                        Ok(true) => {
                            if let MessageKind::LampOn { delay: Some(delay), .. } = &precondition.kind {
                                let needed = *delay + self.ctx.config.timeout();
                                self.raise_timeout(Some(needed));
                            }
                            outgoing.push((precondition.device, precondition.kind));
                        }
                        Ok(false) => tracing::debug!(
                            "{}: {} {} already satisfied",
                            self.label,
                            precondition.device,
                            precondition.kind
                        ),
                        Err(e) => {
                            tracing::warn!("{}: not submitted: {}", self.label, e);
                            if let Some(cmd) = &self.cmd {
                                cmd.warn(e.to_string());
                            }
                            return PendingBatch::failed(self.label, self.cmd, reply);
                        }
                    }
                }
            }
        }

        let mut submitted = Vec::with_capacity(outgoing.len());
        for (device, kind) in outgoing {
            let msg = self.build(&reply, kind, device);
            tracing::debug!("{}: {} -> {}", self.label, msg.kind, device);
            match self.ctx.send(device, msg) {
                Ok(()) => submitted.push(device),
                Err(e) => {
                    tracing::warn!("{}: failed to submit to {}: {}", self.label, device, e);
                    if let Some(cmd) = &self.cmd {
                        cmd.warn(format!("failed to send to {}: {}", device, e));
                    }
                    let mut batch = PendingBatch::failed(self.label, self.cmd, reply);
                    batch.expected = submitted;
                    return batch;
                }
            }
        }

        tracing::info!(
            "{}: {} messages submitted, timeout {:.1}s",
            self.label,
            submitted.len(),
            self.timeout.as_secs_f64()
        );
        PendingBatch {
            label: self.label,
            cmd: self.cmd,
            reply,
            expected: submitted,
            timeout: self.timeout,
            failed: false,
        }
    }

    pub async fn run(self) -> bool {
        self.start().finish().await
    }
}

/// A submitted batch whose replies have not been collected yet
pub struct PendingBatch {
    label: String,
    cmd: Option<CommandHandle>,
    reply: Arc<Channel>,
    expected: Vec<Device>,
    timeout: Duration,
    failed: bool,
}

impl PendingBatch {
    fn failed(label: String, cmd: Option<CommandHandle>, reply: Arc<Channel>) -> Self {
        Self {
            label,
            cmd,
            reply,
            expected: Vec::new(),
            timeout: Duration::ZERO,
            failed: true,
        }
    }

    /// Devices still owing a reply
    pub fn outstanding(&self) -> &[Device] {
        &self.expected
    }

    /// Collect one reply per submitted message
    ///
    /// Returns false on the first failure reply or receive timeout. The reply
    /// channel is closed on return, so late replies are refused.
    pub async fn finish(mut self) -> bool {
        let ok = self.collect().await;
        self.reply.close();
        let stale = self.reply.drain();
        if stale > 0 {
            tracing::debug!("{}: discarded {} unread replies", self.label, stale);
        }
        ok
    }

    async fn collect(&mut self) -> bool {
        if self.failed {
            return false;
        }
        while !self.expected.is_empty() {
            match self.reply.receive(self.timeout).await {
                Received::Message(msg) => {
                    if let Some(sender) = msg.sender {
                        if let Some(pos) = self.expected.iter().position(|d| *d == sender) {
                            self.expected.remove(pos);
                        } else {
                            tracing::warn!("{}: unexpected reply from {}", self.label, sender);
                            self.expected.pop();
                        }
                    } else {
                        self.expected.pop();
                    }

                    match msg.kind {
                        MessageKind::Reply { success: true, .. } | MessageKind::ExposureFinished { success: true } => {}
                        MessageKind::Reply { success: false, detail } => {
                            let who = msg.sender.map(|d| d.name()).unwrap_or("unknown");
                            let detail = detail.unwrap_or_else(|| "no reason given".to_string());
                            tracing::warn!("{}: {} failed: {}", self.label, who, detail);
                            return false;
                        }
                        MessageKind::ExposureFinished { success: false } => {
                            tracing::warn!("{}: exposure failed", self.label);
                            return false;
                        }
                        other => {
                            tracing::error!("{}: {} is not a reply", self.label, other);
                            return false;
                        }
                    }
                }
                Received::TimedOut => {
                    let missing: Vec<&str> = self.expected.iter().map(|d| d.name()).collect();
                    let text = format!(
                        "{} tasks failed to respond; not heard from: {}",
                        missing.len(),
                        missing.join(" ")
                    );
                    tracing::warn!("{}: {}", self.label, text);
                    if let Some(cmd) = &self.cmd {
                        cmd.warn(text);
                    }
                    return false;
                }
            }
        }
        true
    }
}

impl Drop for PendingBatch {
    fn drop(&mut self) {
        self.reply.close();
    }
}

/// Post one message outside any batch, e.g. a top-level procedure request
pub fn post(ctx: &SopContext, device: Device, kind: MessageKind, cmd: Option<CommandHandle>, priority: Priority) -> bool {
    let msg = Message::new(kind).for_command(cmd).with_priority(priority);
    match ctx.send(device, msg) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("failed to post to {}: {}", device, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::SimulatedDeviceOps;
    use crate::event::EventBus;
    use crate::message::{Exposure, ExposureType};
    use crate::status::{Models, StatusModel};

    fn context() -> SopContext {
        let status = Arc::new(StatusModel::new(Models::quiescent(Instant::now())));
        let ops = Arc::new(SimulatedDeviceOps::new(status.clone()));
        SopContext::new(SopConfig::default(), status, ops, EventBus::default())
    }

    /// Answer the next message on `device` like a worker would
    fn answer(ctx: &SopContext, device: Device, success: bool) -> tokio::task::JoinHandle<()> {
        let queue = ctx.queue(device).unwrap();
        tokio::spawn(async move {
            if let Received::Message(msg) = queue.receive(Duration::from_secs(5)).await {
                let reply = msg.reply(device, success, None);
                if let Some(to) = &msg.reply_to {
                    let _ = to.send(reply);
                }
            }
        })
    }

    #[tokio::test]
    async fn test_satisfied_preconditions_send_nothing() {
        let ctx = context();
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_millis(50), "noop");
        for lamp in Device::LAMPS {
            batch.append_precondition(Precondition::lamp(lamp, false));
        }
        batch.append_precondition(Precondition::ffs(true));

        assert!(batch.run().await);
        for device in Device::ALL {
            assert!(ctx.queue(device).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_all_success() {
        let ctx = context();
        let a = answer(&ctx, Device::Ffs, true);
        let b = answer(&ctx, Device::FfLamp, true);
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_secs(2), "prep");
        batch
            .append(Device::Ffs, MessageKind::FfsMove { open: false })
            .append(Device::FfLamp, MessageKind::LampOn { on: true, delay: None });
        assert!(batch.run().await);
        a.await.unwrap();
        b.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reply_returns_before_timeout() {
        let ctx = context();
        let _failer = answer(&ctx, Device::Ffs, false);
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_secs(30), "prep");
        batch
            .append(Device::Ffs, MessageKind::FfsMove { open: false })
            .append(Device::Tcc, MessageKind::Slew(crate::message::SlewTarget::Mount {
                az: 121.0,
                alt: 90.0,
                rot: 0.0,
            }));

        let started = Instant::now();
        assert!(!batch.run().await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_reports_missing_devices() {
        let ctx = context();
        let mut rx = ctx.events.subscribe();
        let cmd = CommandHandle::new("gotoField", ctx.events.clone());
        let _ffs = answer(&ctx, Device::Ffs, true);
        let mut batch = MultiCommand::new(&ctx, Some(cmd), Duration::from_millis(50), "slew");
        batch
            .append(Device::Ffs, MessageKind::FfsMove { open: false })
            .append(Device::Guider, MessageKind::GuiderStop);

        assert!(!batch.run().await);
        let mut warned = false;
        while let Ok(event) = rx.try_recv() {
            if let crate::event::SopEvent::CommandMessage { text, .. } = event {
                warned |= text == "1 tasks failed to respond; not heard from: guider";
            }
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn test_late_reply_is_refused() {
        let ctx = context();
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_millis(20), "late");
        batch.append(Device::Boss, MessageKind::Hartmann);
        assert!(!batch.run().await);

        let queue = ctx.queue(Device::Boss).unwrap();
        let msg = match queue.receive(Duration::from_millis(10)).await {
            Received::Message(msg) => msg,
            Received::TimedOut => panic!("message was not submitted"),
        };
        assert_eq!(msg.duration, Some(Duration::from_secs(240)));
        let reply_to = msg.reply_to.clone().unwrap();
        assert!(reply_to.send(msg.reply(Device::Boss, true, None)).is_err());
    }

    #[tokio::test]
    async fn test_indeterminate_shutter_fails_without_submitting() {
        let ctx = context();
        ctx.status.update(|m| m.apogee_shutter = Some((true, true)));
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_secs(1), "shutter");
        batch
            .append(Device::Ffs, MessageKind::FfsMove { open: true })
            .append_precondition(Precondition::apogee_shutter(false));
        assert!(!batch.run().await);
        assert!(ctx.queue(Device::Ffs).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_raised_by_longer_entries() {
        let ctx = context();
        let mut batch = MultiCommand::new(&ctx, None, Duration::from_secs(10), "t");
        batch.append_with_timeout(Device::Boss, MessageKind::Hartmann, Duration::from_secs(250));
        batch.append_with_timeout(Device::Ffs, MessageKind::FfsMove { open: true }, Duration::from_secs(20));
        assert_eq!(batch.timeout(), Duration::from_secs(250));
    }

    #[test]
    fn test_expected_durations() {
        let config = SopConfig::default();
        let arc = MessageKind::Expose(Exposure::new(ExposureType::Arc, 4.0).without_readout());
        assert_eq!(expected_duration(&config, Device::Boss, &arc), Some(Duration::from_secs(29)));
        let flat = MessageKind::Expose(Exposure::new(ExposureType::Flat, 30.0));
        assert_eq!(expected_duration(&config, Device::Boss, &flat), Some(Duration::from_secs(145)));
        let guider = MessageKind::Expose(Exposure::new(ExposureType::Flat, 0.5));
        assert_eq!(
            expected_duration(&config, Device::Guider, &guider),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            expected_duration(&config, Device::Ffs, &MessageKind::FfsMove { open: true }),
            Some(Duration::from_secs(10))
        );
        assert_eq!(expected_duration(&config, Device::Tcc, &MessageKind::GuiderStop), None);
    }
}
