use crate::constants::{
    DEFAULT_DEVICE_TIMEOUT_MS, DEFAULT_MAX_OPEN_PIPES, DEFAULT_PIPE_IDLE_TIMEOUT_MS,
};
use crate::device::{Announce, DeviceChange, DeviceTable};
use crate::dispatch::{
    CommandKind, Dispatch, DispatchMiss, Dispatcher, EventHandler, EventHeaderRaw,
    EventNotification, MissHandler, ServiceHandler, resolve_event, resolve_payload,
};
use crate::error::JdError;
use crate::frame::Frame;
use crate::pipe::{PipeAssembler, PipeDescriptor, PipeFrameOutcome, PipeHandle};
use crate::registry::Registry;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use zerocopy::FromBytes;

pub type DeviceObserver = Box<dyn FnMut(&DeviceChange) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Host identity used when opening inbound pipes.
    pub host_device_id: u64,
    /// Devices silent longer than this are dropped on `sweep`.
    pub device_timeout_ms: u64,
    /// Inbound pipes idle longer than this are closed on `sweep`.
    pub pipe_idle_timeout_ms: u64,
    pub max_open_pipes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            host_device_id: 0x4a44_4255_5300_0001,
            device_timeout_ms: DEFAULT_DEVICE_TIMEOUT_MS,
            pipe_idle_timeout_ms: DEFAULT_PIPE_IDLE_TIMEOUT_MS,
            max_open_pipes: DEFAULT_MAX_OPEN_PIPES,
        }
    }
}

/// Counters over everything the bus has seen since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub crc_errors: u64,
    pub announces: u64,
    pub commands: u64,
    pub reports: u64,
    pub events: u64,
    pub pipe_frames: u64,
    pub pipe_timeouts: u64,
    pub dispatch_misses: u64,
    pub devices_expired: u64,
}

/// The bus engine: validated frames in, routed traffic out.
///
/// All state transitions happen in `process` and `sweep`, both driven by a
/// caller-supplied millisecond clock, so the engine itself never consults
/// wall time and every timeout is reproducible in tests.
pub struct Bus {
    registry: Registry,
    devices: DeviceTable,
    pipes: PipeAssembler,
    dispatcher: Dispatcher,
    pending_reports: HashMap<(u64, u8, u16), oneshot::Sender<Dispatch>>,
    device_observer: Option<DeviceObserver>,
    stats: BusStats,
    host_device_id: u64,
}

impl Bus {
    pub fn new(registry: Registry, config: &BusConfig) -> Self {
        Bus {
            registry,
            devices: DeviceTable::new(config.device_timeout_ms),
            pipes: PipeAssembler::new(config.pipe_idle_timeout_ms, config.max_open_pipes),
            dispatcher: Dispatcher::new(),
            pending_reports: HashMap::new(),
            device_observer: None,
            stats: BusStats::default(),
            host_device_id: config.host_device_id,
        }
    }

    /// A bus over the built-in service catalog with default limits.
    pub fn with_core_registry() -> Result<Self, JdError> {
        Ok(Bus::new(Registry::core()?, &BusConfig::default()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn host_device_id(&self) -> u64 {
        self.host_device_id
    }

    /// Install the single handler for a class, replacing any previous one.
    pub fn set_handler(&mut self, service_class: u32, handler: ServiceHandler) -> bool {
        self.dispatcher.set_handler(service_class, handler)
    }

    pub fn clear_handler(&mut self, service_class: u32) -> bool {
        self.dispatcher.clear_handler(service_class)
    }

    /// Subscribe to events on a class; subscriptions accumulate.
    pub fn add_event_handler(&mut self, service_class: u32, handler: EventHandler) {
        self.dispatcher.add_event_handler(service_class, handler)
    }

    /// Observe frames that resolve or deliver to nothing.
    pub fn set_miss_handler(&mut self, handler: MissHandler) {
        self.dispatcher.set_miss_handler(handler)
    }

    /// Observe device lifecycle transitions from announces and expiry.
    pub fn set_device_observer(&mut self, observer: DeviceObserver) {
        self.device_observer = Some(observer);
    }

    /// Validate and route one raw frame. Undecodable input is counted and
    /// dropped; every decodable frame takes exactly one path through the
    /// engine.
    pub fn process(&mut self, raw: &[u8], now_ms: u64) {
        match Frame::decode(raw) {
            Ok(frame) => self.process_frame(frame, now_ms),
            Err(err) => {
                if matches!(err, JdError::CrcMismatch { .. }) {
                    self.stats.crc_errors += 1;
                }
                self.stats.frames_dropped += 1;
                warn!("dropping frame: {err}");
            }
        }
    }

    /// Route one already-validated frame.
    pub fn process_frame(&mut self, frame: Frame, now_ms: u64) {
        self.stats.frames_processed += 1;
        trace!("rx {frame}");

        // Reports prove the sender is alive. Command frames carry the
        // destination id, so they say nothing about the named device.
        if frame.is_report() {
            self.devices.touch(frame.device_id, now_ms);
        }

        if frame.is_announce() {
            self.handle_announce(&frame, now_ms);
        } else if frame.is_pipe() {
            self.handle_pipe(&frame, now_ms);
        } else if frame.is_multicast() {
            self.stats.commands += 1;
            self.handle_multicast(&frame);
        } else if frame.is_command() {
            self.stats.commands += 1;
            self.handle_addressed(&frame);
        } else {
            self.stats.reports += 1;
            self.handle_report(&frame);
        }
    }

    /// Drop expired devices and close idle pipes.
    pub fn sweep(&mut self, now_ms: u64) {
        let expired = self.devices.sweep(now_ms);
        self.stats.devices_expired += expired.len() as u64;
        for change in &expired {
            self.notify_device(change);
        }
        self.stats.pipe_timeouts += self.pipes.sweep(now_ms) as u64;
    }

    /// Allocate an inbound pipe on the host identity. The descriptor is what
    /// a device expects inside a pipe-opening command payload.
    pub fn open_pipe(&mut self, now_ms: u64) -> Result<(PipeDescriptor, PipeHandle), JdError> {
        self.pipes.open(self.host_device_id, now_ms)
    }

    pub fn open_pipe_count(&self) -> usize {
        self.pipes.open_count()
    }

    /// Arrange for the next report matching (device, service, command) to be
    /// delivered out-of-band instead of through the class handler. A second
    /// watch on the same key replaces the first, whose receiver then yields
    /// a closed-channel error.
    pub fn watch_report(
        &mut self,
        device_id: u64,
        service_index: u8,
        service_command: u16,
    ) -> oneshot::Receiver<Dispatch> {
        let (tx, rx) = oneshot::channel();
        self.pending_reports
            .insert((device_id, service_index, service_command), tx);
        rx
    }

    /// Drop a watch that will never complete, e.g. after a client timeout.
    pub fn unwatch_report(
        &mut self,
        device_id: u64,
        service_index: u8,
        service_command: u16,
    ) -> bool {
        self.pending_reports
            .remove(&(device_id, service_index, service_command))
            .is_some()
    }

    fn notify_device(&mut self, change: &DeviceChange) {
        if let Some(observer) = self.device_observer.as_mut() {
            observer(change);
        }
    }

    fn miss(&mut self, frame: &Frame, miss: DispatchMiss) {
        self.stats.dispatch_misses += 1;
        self.dispatcher.miss(frame, miss);
    }

    fn service_class_of(&self, device_id: u64, service_index: u8) -> Result<u32, DispatchMiss> {
        let Some(device) = self.devices.get(device_id) else {
            return Err(DispatchMiss::UnknownDevice);
        };
        device
            .service_class(service_index)
            .ok_or(DispatchMiss::UnknownServiceIndex { service_index })
    }

    fn handle_announce(&mut self, frame: &Frame, now_ms: u64) {
        self.stats.announces += 1;
        let announce = match Announce::from_payload(&frame.payload) {
            Ok(announce) => announce,
            Err(err) => {
                self.miss(
                    frame,
                    DispatchMiss::BadAnnounce {
                        error: err.to_string(),
                    },
                );
                return;
            }
        };
        let changes = self
            .devices
            .apply_announce(frame.device_id, &announce, now_ms);
        for change in &changes {
            self.notify_device(change);
        }
    }

    fn handle_pipe(&mut self, frame: &Frame, now_ms: u64) {
        self.stats.pipe_frames += 1;
        match self.pipes.handle_frame(frame, now_ms) {
            PipeFrameOutcome::UnknownPort(port) => {
                self.miss(frame, DispatchMiss::UnknownPipePort { port });
            }
            outcome => trace!("pipe frame: {outcome:?}"),
        }
    }

    /// Multicast commands name a class, not a device. Deliver once per bound
    /// service instance currently in the table.
    fn handle_multicast(&mut self, frame: &Frame) {
        let Some(class) = frame.multicast_class() else {
            return;
        };
        let instances = self.devices.instances_of(class);
        if instances.is_empty() {
            self.miss(
                frame,
                DispatchMiss::NoHandler {
                    service_class: class,
                },
            );
            return;
        }
        let kind = CommandKind::from(frame.service_command);
        let Some((name, values)) =
            resolve_payload(&self.registry, class, kind, true, &frame.payload)
        else {
            self.miss(
                frame,
                DispatchMiss::UnknownCommand {
                    service_class: class,
                    command: frame.service_command,
                },
            );
            return;
        };
        if !self.dispatcher.has_handler(class) {
            self.miss(
                frame,
                DispatchMiss::NoHandler {
                    service_class: class,
                },
            );
            return;
        }
        for (device_id, service_index) in instances {
            let dispatch = Dispatch {
                device_id,
                service_index,
                service_class: Some(class),
                is_command: true,
                kind,
                name: Some(name.clone()),
                payload: frame.payload.clone(),
                values: values.clone(),
            };
            self.dispatcher.deliver(&dispatch);
        }
    }

    /// A command addressed to one device, ours or otherwise.
    fn handle_addressed(&mut self, frame: &Frame) {
        let class = match self.service_class_of(frame.device_id, frame.service_index) {
            Ok(class) => class,
            Err(miss) => {
                self.miss(frame, miss);
                return;
            }
        };
        self.dispatch_resolved(frame, class, true);
    }

    fn handle_report(&mut self, frame: &Frame) {
        let key = (frame.device_id, frame.service_index, frame.service_command);
        if let Some(waiter) = self.pending_reports.remove(&key) {
            self.complete_watch(frame, waiter);
            return;
        }

        let class = match self.service_class_of(frame.device_id, frame.service_index) {
            Ok(class) => class,
            Err(miss) => {
                self.miss(frame, miss);
                return;
            }
        };

        if frame.is_event() {
            self.handle_event(frame, class);
            return;
        }
        self.dispatch_resolved(frame, class, false);
    }

    /// Correlated replies go to their waiter even when the device has never
    /// announced; the class and metadata are then simply absent.
    fn complete_watch(&mut self, frame: &Frame, waiter: oneshot::Sender<Dispatch>) {
        let kind = CommandKind::from(frame.service_command);
        let class = self
            .service_class_of(frame.device_id, frame.service_index)
            .ok();
        let (name, values) = match class {
            Some(class) => {
                match resolve_payload(&self.registry, class, kind, false, &frame.payload) {
                    Some((name, values)) => (Some(name), values),
                    None => (None, None),
                }
            }
            None => (None, None),
        };
        let dispatch = Dispatch {
            device_id: frame.device_id,
            service_index: frame.service_index,
            service_class: class,
            is_command: false,
            kind,
            name,
            payload: frame.payload.clone(),
            values,
        };
        if waiter.send(dispatch).is_err() {
            debug!(
                "waiter for {:016x}/{} cmd {:#06x} gone before its report",
                frame.device_id, frame.service_index, frame.service_command
            );
        }
    }

    fn handle_event(&mut self, frame: &Frame, class: u32) {
        let Ok((header, tail)) = EventHeaderRaw::ref_from_prefix(&frame.payload) else {
            self.miss(
                frame,
                DispatchMiss::BadPayload {
                    service_class: class,
                    error: format!("event payload too short: {} bytes", frame.payload.len()),
                },
            );
            return;
        };
        self.stats.events += 1;
        let event_id = header.event_id.get();
        let event_arg = header.event_arg.get();
        let (name, values) = resolve_event(&self.registry, class, event_id, tail);
        let event = EventNotification {
            device_id: frame.device_id,
            service_index: frame.service_index,
            service_class: class,
            event_id,
            event_arg,
            name,
            payload: Bytes::copy_from_slice(tail),
            values,
        };
        let delivered = self.dispatcher.deliver_event(&event);
        trace!(
            "event {:#x} on class {:#010x} to {} subscriber(s)",
            event_id, class, delivered
        );
    }

    fn dispatch_resolved(&mut self, frame: &Frame, class: u32, is_command: bool) {
        let kind = CommandKind::from(frame.service_command);
        let Some((name, values)) =
            resolve_payload(&self.registry, class, kind, is_command, &frame.payload)
        else {
            self.miss(
                frame,
                DispatchMiss::UnknownCommand {
                    service_class: class,
                    command: frame.service_command,
                },
            );
            return;
        };
        let dispatch = Dispatch {
            device_id: frame.device_id,
            service_index: frame.service_index,
            service_class: Some(class),
            is_command,
            kind,
            name: Some(name),
            payload: frame.payload.clone(),
            values,
        };
        if !self.dispatcher.deliver(&dispatch) {
            self.miss(
                frame,
                DispatchMiss::NoHandler {
                    service_class: class,
                },
            );
        }
    }
}
