use crate::constants::{
    ANNOUNCE_FLAG_SUPPORTS_ACK, RESTART_COUNTER_MASK, SERVICE_INDEX_CONTROL, SRV_CONTROL,
};
use crate::error::JdError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Wire layout of the fixed announce prefix; service classes follow.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AnnounceHeaderRaw {
    pub restart_counter: u8, // low 4 bits meaningful, upper 4 reserved
    pub flags: u8,           //
    pub packet_count: u8,    // frames sent since previous announce
    pub reserved: u8,        //
}

/// A decoded control-service announce report.
///
/// The k-th listed class describes service index k+1; index 0 is always the
/// control service and is not listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub restart_counter: u8,
    pub flags: u8,
    pub packet_count: u8,
    pub service_classes: Vec<u32>,
}

impl Announce {
    pub fn from_payload(payload: &[u8]) -> Result<Self, JdError> {
        let header_size = size_of::<AnnounceHeaderRaw>();
        if payload.len() < header_size {
            return Err(JdError::InvalidAnnounce(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        let header = AnnounceHeaderRaw::ref_from_bytes(&payload[..header_size])
            .map_err(|_| JdError::InvalidAnnounce("bad header".to_string()))?;
        let service_classes = payload[header_size..]
            .chunks_exact(4)
            .map(|c| U32::ref_from_bytes(c).map(|v| v.get()))
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| JdError::InvalidAnnounce("bad service class list".to_string()))?;
        Ok(Announce {
            restart_counter: header.restart_counter,
            flags: header.flags,
            packet_count: header.packet_count,
            service_classes,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 4 * self.service_classes.len());
        buf.put_u8(self.restart_counter);
        buf.put_u8(self.flags);
        buf.put_u8(self.packet_count);
        buf.put_u8(0);
        for class in &self.service_classes {
            buf.put_u32_le(*class);
        }
        buf.freeze()
    }

    /// Restart counter with the reserved upper bits stripped.
    pub fn restart_generation(&self) -> u8 {
        self.restart_counter & RESTART_COUNTER_MASK
    }

    pub fn supports_ack(&self) -> bool {
        self.flags & ANNOUNCE_FLAG_SUPPORTS_ACK != 0
    }
}

/// Soft state for one announced device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: u64,
    pub restart_counter: u8,
    pub announce_flags: u8,
    pub packet_count: u8,
    /// Classes for service indices 1..; index 0 is implicit control.
    pub service_classes: Vec<u32>,
    pub last_seen_ms: u64,
}

impl Device {
    fn from_announce(device_id: u64, announce: &Announce, now_ms: u64) -> Self {
        Device {
            device_id,
            restart_counter: announce.restart_counter,
            announce_flags: announce.flags,
            packet_count: announce.packet_count,
            service_classes: announce.service_classes.clone(),
            last_seen_ms: now_ms,
        }
    }

    /// Class bound to a service index, if the index exists on this device.
    pub fn service_class(&self, service_index: u8) -> Option<u32> {
        if service_index == SERVICE_INDEX_CONTROL {
            return Some(SRV_CONTROL);
        }
        self.service_classes
            .get(service_index as usize - 1)
            .copied()
    }

    /// Lowest service index bound to `class`.
    pub fn service_index_of(&self, class: u32) -> Option<u8> {
        self.services().find(|(_, c)| *c == class).map(|(i, _)| i)
    }

    /// All (service_index, service_class) pairs, control included.
    pub fn services(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        std::iter::once((SERVICE_INDEX_CONTROL, SRV_CONTROL)).chain(
            self.service_classes
                .iter()
                .enumerate()
                .map(|(k, c)| (k as u8 + 1, *c)),
        )
    }

    pub fn restart_generation(&self) -> u8 {
        self.restart_counter & RESTART_COUNTER_MASK
    }

    pub fn supports_ack(&self) -> bool {
        self.announce_flags & ANNOUNCE_FLAG_SUPPORTS_ACK != 0
    }
}

/// Device lifecycle transitions, reported by [`DeviceTable`] mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    Connected { device_id: u64 },
    Restarted { device_id: u64 },
    ServicesChanged { device_id: u64 },
    Disconnected { device_id: u64 },
}

/// Announce-driven table of currently visible devices.
///
/// Time is supplied by the caller as milliseconds on a monotonic scale; the
/// table never reads a clock itself. Bindings learned here are soft state:
/// a restart or an expiry invalidates them.
#[derive(Debug)]
pub struct DeviceTable {
    devices: HashMap<u64, Device>,
    timeout_ms: u64,
}

impl DeviceTable {
    pub fn new(timeout_ms: u64) -> Self {
        DeviceTable {
            devices: HashMap::new(),
            timeout_ms,
        }
    }

    /// Fold one announce into the table, returning lifecycle transitions.
    pub fn apply_announce(
        &mut self,
        device_id: u64,
        announce: &Announce,
        now_ms: u64,
    ) -> Vec<DeviceChange> {
        let Some(existing) = self.devices.get_mut(&device_id) else {
            info!(
                "device {:016x} connected with {} service(s)",
                device_id,
                announce.service_classes.len()
            );
            self.devices
                .insert(device_id, Device::from_announce(device_id, announce, now_ms));
            return vec![DeviceChange::Connected { device_id }];
        };

        let mut changes = Vec::new();
        if announce.restart_generation() < existing.restart_generation() {
            info!("device {:016x} restarted", device_id);
            *existing = Device::from_announce(device_id, announce, now_ms);
            changes.push(DeviceChange::Restarted { device_id });
        } else if announce.service_classes != existing.service_classes {
            debug!("device {:016x} changed its service list", device_id);
            existing.service_classes = announce.service_classes.clone();
            changes.push(DeviceChange::ServicesChanged { device_id });
        }
        existing.restart_counter = announce.restart_counter;
        existing.announce_flags = announce.flags;
        existing.packet_count = announce.packet_count;
        existing.last_seen_ms = now_ms;
        changes
    }

    /// Record non-announce traffic from a device, refreshing its expiry.
    pub fn touch(&mut self, device_id: u64, now_ms: u64) {
        if let Some(dev) = self.devices.get_mut(&device_id) {
            dev.last_seen_ms = now_ms;
        }
    }

    pub fn get(&self, device_id: u64) -> Option<&Device> {
        self.devices.get(&device_id)
    }

    pub fn contains(&self, device_id: u64) -> bool {
        self.devices.contains_key(&device_id)
    }

    /// Resolve a (device, service index) pair to its service class.
    pub fn service_class(&self, device_id: u64, service_index: u8) -> Option<u32> {
        self.devices.get(&device_id)?.service_class(service_index)
    }

    /// All (device_id, service_index) pairs currently bound to `class`.
    pub fn instances_of(&self, class: u32) -> Vec<(u64, u8)> {
        let mut out: Vec<(u64, u8)> = self
            .devices
            .values()
            .flat_map(|dev| {
                dev.services()
                    .filter(move |(_, c)| *c == class)
                    .map(move |(i, _)| (dev.device_id, i))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Drop devices not seen within the timeout, returning their transitions.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<DeviceChange> {
        let timeout = self.timeout_ms;
        let mut gone = Vec::new();
        self.devices.retain(|device_id, dev| {
            if now_ms.saturating_sub(dev.last_seen_ms) > timeout {
                info!("device {:016x} lost (no announce)", device_id);
                gone.push(DeviceChange::Disconnected {
                    device_id: *device_id,
                });
                false
            } else {
                true
            }
        });
        gone
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(restart: u8, classes: &[u32]) -> Announce {
        Announce {
            restart_counter: restart,
            flags: 0,
            packet_count: 0,
            service_classes: classes.to_vec(),
        }
    }

    #[test]
    fn announce_payload_roundtrip() {
        let a = announce(3, &[0x1473a263, 0x1421bac7]);
        let parsed = Announce::from_payload(&a.to_payload()).unwrap();
        assert_eq!(parsed, a);
    }

    #[test]
    fn announce_rejects_short_payload() {
        assert!(matches!(
            Announce::from_payload(&[1, 0]),
            Err(JdError::InvalidAnnounce(_))
        ));
    }

    #[test]
    fn trailing_partial_class_is_ignored() {
        let mut payload = announce(1, &[0x1473a263]).to_payload().to_vec();
        payload.extend_from_slice(&[0xaa, 0xbb]);
        let parsed = Announce::from_payload(&payload).unwrap();
        assert_eq!(parsed.service_classes, vec![0x1473a263]);
    }

    #[test]
    fn index_zero_is_control() {
        let mut table = DeviceTable::new(1500);
        table.apply_announce(0xd0, &announce(1, &[0x1473a263]), 0);
        assert_eq!(table.service_class(0xd0, 0), Some(SRV_CONTROL));
        assert_eq!(table.service_class(0xd0, 1), Some(0x1473a263));
        assert_eq!(table.service_class(0xd0, 2), None);
    }

    #[test]
    fn restart_counter_decrease_recreates_device() {
        let mut table = DeviceTable::new(1500);
        table.apply_announce(0xd0, &announce(7, &[0x1473a263]), 0);
        let changes = table.apply_announce(0xd0, &announce(1, &[0x1473a263]), 100);
        assert_eq!(changes, vec![DeviceChange::Restarted { device_id: 0xd0 }]);

        // increase is the normal path, not a restart
        let changes = table.apply_announce(0xd0, &announce(2, &[0x1473a263]), 200);
        assert!(changes.is_empty());
    }

    #[test]
    fn reserved_restart_bits_do_not_trigger_restart() {
        let mut table = DeviceTable::new(1500);
        table.apply_announce(0xd0, &announce(0x12, &[]), 0);
        let changes = table.apply_announce(0xd0, &announce(0x02, &[]), 100);
        assert!(changes.is_empty());
    }

    #[test]
    fn sweep_expires_silent_devices() {
        let mut table = DeviceTable::new(1500);
        table.apply_announce(0xd0, &announce(1, &[]), 0);
        table.apply_announce(0xd1, &announce(1, &[]), 1000);
        assert!(table.sweep(1500).is_empty());
        let changes = table.sweep(1501);
        assert_eq!(
            changes,
            vec![DeviceChange::Disconnected { device_id: 0xd0 }]
        );
        assert!(table.contains(0xd1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn instances_span_devices() {
        let mut table = DeviceTable::new(1500);
        table.apply_announce(0xd0, &announce(1, &[0x1473a263, 0x1421bac7]), 0);
        table.apply_announce(0xd1, &announce(1, &[0x1473a263]), 0);
        assert_eq!(
            table.instances_of(0x1473a263),
            vec![(0xd0, 1), (0xd1, 1)]
        );
        assert_eq!(table.instances_of(0x1421bac7), vec![(0xd0, 2)]);
    }
}
