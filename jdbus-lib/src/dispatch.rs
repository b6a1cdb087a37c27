use crate::constants::{CMD_GET_REGISTER, CMD_SET_REGISTER, REGISTER_CODE_MASK};
use crate::frame::Frame;
use crate::pack::Value;
use crate::registry::Registry;
use bytes::Bytes;
use num_enum::{FromPrimitive, IntoPrimitive};
use std::collections::HashMap;
use strum_macros::Display;
use tracing::{debug, trace};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Well-known command codes shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum SystemCommand {
    Announce = 0x0000,
    Event = 0x0001,
    Calibrate = 0x0002,
    #[num_enum(catch_all)]
    Other(u16),
}

/// A service_command word, classified by its register-aliasing range.
///
/// `0x1000 | N` reads register `N`, `0x2000 | N` writes it; everything else
/// is a plain action. The aliasing is protocol-wide and applies to every
/// service class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Action(u16),
    GetRegister(u16),
    SetRegister(u16),
}

impl From<u16> for CommandKind {
    fn from(word: u16) -> Self {
        match word & 0xf000 {
            CMD_GET_REGISTER => CommandKind::GetRegister(word & REGISTER_CODE_MASK),
            CMD_SET_REGISTER => CommandKind::SetRegister(word & REGISTER_CODE_MASK),
            _ => CommandKind::Action(word),
        }
    }
}

impl CommandKind {
    /// The wire command word for this kind.
    pub fn to_word(self) -> u16 {
        match self {
            CommandKind::Action(code) => code,
            CommandKind::GetRegister(code) => CMD_GET_REGISTER | (code & REGISTER_CODE_MASK),
            CommandKind::SetRegister(code) => CMD_SET_REGISTER | (code & REGISTER_CODE_MASK),
        }
    }

    /// The register code, for register reads and writes.
    pub fn register_code(self) -> Option<u16> {
        match self {
            CommandKind::Action(_) => None,
            CommandKind::GetRegister(code) | CommandKind::SetRegister(code) => Some(code),
        }
    }
}

/// A resolved, decoded frame as handed to a service handler or report waiter.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub device_id: u64,
    pub service_index: u8,
    /// `None` only for correlated reports from a device with no announce
    /// binding yet; handler deliveries always carry the class.
    pub service_class: Option<u32>,
    /// Direction: true for command frames, false for reports.
    pub is_command: bool,
    pub kind: CommandKind,
    /// Registry name of the register or command, when known.
    pub name: Option<String>,
    pub payload: Bytes,
    /// Payload decoded via the registry format, when one applies.
    pub values: Option<Vec<Value>>,
}

/// Wire prefix of every event report; event-specific bytes follow.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EventHeaderRaw {
    pub event_id: U32,  //
    pub event_arg: U32, // sequence number, or event-specific
}

/// A decoded event report, broadcast to class subscribers.
#[derive(Debug, Clone)]
pub struct EventNotification {
    pub device_id: u64,
    pub service_index: u8,
    pub service_class: u32,
    pub event_id: u32,
    pub event_arg: u32,
    /// Registry name of the event, when known.
    pub name: Option<String>,
    /// Bytes following the id/argument prefix.
    pub payload: Bytes,
    /// `payload` decoded via the registry event format, when one exists.
    pub values: Option<Vec<Value>>,
}

/// Why a frame could not be delivered to a service handler.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchMiss {
    /// Report from a device the table has no announce for.
    UnknownDevice,
    /// Device known, but the announce bound nothing to this index.
    UnknownServiceIndex { service_index: u8 },
    /// The registry has no entry for this (class, command) pair.
    UnknownCommand { service_class: u32, command: u16 },
    /// Resolved fine, but no handler is registered for the class.
    NoHandler { service_class: u32 },
    /// The payload does not hold what the protocol requires.
    BadPayload { service_class: u32, error: String },
    /// Pipe frame for a port nobody opened.
    UnknownPipePort { port: u16 },
    /// Announce payload that does not parse.
    BadAnnounce { error: String },
}

pub type ServiceHandler = Box<dyn FnMut(&Dispatch) + Send>;
pub type EventHandler = Box<dyn FnMut(&EventNotification) + Send>;
pub type MissHandler = Box<dyn FnMut(&Frame, &DispatchMiss) + Send>;

/// Routes resolved frames to handlers.
///
/// Each service class has at most one service handler; registering again
/// replaces the previous one. Event subscriptions are additive: every
/// subscriber for a class sees every event on it. Frames that cannot be
/// resolved or delivered go to the single miss handler, so nothing ever
/// disappears silently.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u32, ServiceHandler>,
    event_handlers: HashMap<u32, Vec<EventHandler>>,
    miss_handler: Option<MissHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for a class, returning true when one was replaced.
    pub fn set_handler(&mut self, service_class: u32, handler: ServiceHandler) -> bool {
        self.handlers.insert(service_class, handler).is_some()
    }

    pub fn clear_handler(&mut self, service_class: u32) -> bool {
        self.handlers.remove(&service_class).is_some()
    }

    pub fn has_handler(&self, service_class: u32) -> bool {
        self.handlers.contains_key(&service_class)
    }

    /// Subscribe to events on a class, alongside any existing subscribers.
    pub fn add_event_handler(&mut self, service_class: u32, handler: EventHandler) {
        self.event_handlers
            .entry(service_class)
            .or_default()
            .push(handler);
    }

    pub fn set_miss_handler(&mut self, handler: MissHandler) {
        self.miss_handler = Some(handler);
    }

    /// Hand a dispatch to its class handler. False means nobody took it.
    pub(crate) fn deliver(&mut self, dispatch: &Dispatch) -> bool {
        let Some(class) = dispatch.service_class else {
            return false;
        };
        match self.handlers.get_mut(&class) {
            Some(handler) => {
                trace!("dispatch {:?} to class {:#010x}", dispatch.kind, class);
                handler(dispatch);
                true
            }
            None => false,
        }
    }

    /// Broadcast an event to all subscribers of its class.
    pub(crate) fn deliver_event(&mut self, event: &EventNotification) -> usize {
        let Some(subs) = self.event_handlers.get_mut(&event.service_class) else {
            return 0;
        };
        for handler in subs.iter_mut() {
            handler(event);
        }
        subs.len()
    }

    /// Report an undeliverable frame to the miss handler.
    pub(crate) fn miss(&mut self, frame: &Frame, miss: DispatchMiss) {
        debug!("dispatch miss ({miss}): {frame}");
        if let Some(handler) = self.miss_handler.as_mut() {
            handler(frame, &miss);
        }
    }
}

/// Look up the name and payload format for a classified command, and decode.
///
/// Returns `None` when the registry knows nothing about the pair, which the
/// caller reports as an `UnknownCommand` miss. A register read carries no
/// request payload, so in the command direction only its name applies.
pub(crate) fn resolve_payload(
    registry: &Registry,
    service_class: u32,
    kind: CommandKind,
    is_command: bool,
    payload: &[u8],
) -> Option<(String, Option<Vec<Value>>)> {
    match kind {
        CommandKind::GetRegister(code) => {
            let entry = registry.register(service_class, code)?;
            let values = if is_command {
                None
            } else {
                Some(entry.format.unpack(payload))
            };
            Some((entry.name.clone(), values))
        }
        CommandKind::SetRegister(code) => {
            let entry = registry.register(service_class, code)?;
            Some((entry.name.clone(), Some(entry.format.unpack(payload))))
        }
        CommandKind::Action(code) => {
            let entry = registry.command(service_class, code)?;
            let format = if is_command {
                entry.request.as_ref()
            } else {
                entry.report.as_ref()
            };
            Some((entry.name.clone(), format.map(|f| f.unpack(payload))))
        }
    }
}

/// Name and decode an event's trailing payload. Unknown events still flow;
/// they just lack a name.
pub(crate) fn resolve_event(
    registry: &Registry,
    service_class: u32,
    event_id: u32,
    tail: &[u8],
) -> (Option<String>, Option<Vec<Value>>) {
    match registry.event(service_class, event_id) {
        Some(entry) => (
            Some(entry.name.clone()),
            entry.payload.as_ref().map(|f| f.unpack(tail)),
        ),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_aliasing_ranges() {
        assert_eq!(CommandKind::from(0x1005), CommandKind::GetRegister(0x005));
        assert_eq!(CommandKind::from(0x2005), CommandKind::SetRegister(0x005));
        assert_eq!(CommandKind::from(0x1000), CommandKind::GetRegister(0x000));
        assert_eq!(CommandKind::from(0x1fff), CommandKind::GetRegister(0xfff));
        assert_eq!(CommandKind::from(0x2fff), CommandKind::SetRegister(0xfff));
        assert_eq!(CommandKind::from(0x0fff), CommandKind::Action(0x0fff));
        assert_eq!(CommandKind::from(0x3000), CommandKind::Action(0x3000));
        assert_eq!(CommandKind::from(0x0080), CommandKind::Action(0x0080));
    }

    #[test]
    fn kind_words_roundtrip() {
        for word in [0x0000u16, 0x0080, 0x1101, 0x2e01, 0x3abc, 0xffff] {
            assert_eq!(CommandKind::from(word).to_word(), word);
        }
    }

    #[test]
    fn system_command_catch_all() {
        assert_eq!(SystemCommand::from(0x0001), SystemCommand::Event);
        assert_eq!(SystemCommand::from(0x0080), SystemCommand::Other(0x0080));
        assert_eq!(u16::from(SystemCommand::Calibrate), 0x0002);
    }
}
