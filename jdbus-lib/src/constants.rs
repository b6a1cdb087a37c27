// Protocol constants for the JACDAC bus

/// Size of the frame header (crc + device id + flags/size/index + command)
pub const FRAME_HEADER_SIZE: usize = 15;

/// Maximum payload bytes a single frame can carry
pub const MAX_SERVICE_SIZE: usize = 236;

/// Maximum size of a complete frame on the wire
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_SERVICE_SIZE;

/// Frame flag: this frame is a command (device-bound); clear means report
pub const FRAME_FLAG_COMMAND: u8 = 0x01;

/// Frame flag: sender requests an ACK for this frame
pub const FRAME_FLAG_ACK_REQUESTED: u8 = 0x02;

/// Frame flag: device id field holds a service class (multicast command)
pub const FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS: u8 = 0x04;

/// Service index of the control service, present on every device
pub const SERVICE_INDEX_CONTROL: u8 = 0x00;

/// Reserved service index carrying pipe traffic
pub const SERVICE_INDEX_PIPE: u8 = 0x3e;

/// Service indices are 6 bits on the wire
pub const SERVICE_INDEX_MASK: u8 = 0x3f;

/// Register codes occupy the low 12 bits of a command word
pub const REGISTER_CODE_MASK: u16 = 0x0fff;

/// Command word of the periodic announce report, on service index 0
pub const CMD_ANNOUNCE: u16 = 0x0000;

/// Command word of event reports (`u32 event_id, u32 argument`)
pub const CMD_EVENT: u16 = 0x0001;

/// Command word base for register reads (`0x1000 | code`)
pub const CMD_GET_REGISTER: u16 = 0x1000;

/// Command word base for register writes (`0x2000 | code`)
pub const CMD_SET_REGISTER: u16 = 0x2000;

/// Size of a pipe descriptor payload (device id + port + reserved)
pub const PIPE_DESCRIPTOR_SIZE: usize = 12;

/// Pipe ports are 9 bits of the pipe command word
pub const MAX_PIPE_PORT: u16 = 0x1ff;

/// Pipe counters wrap modulo 32 (5 bits)
pub const PIPE_COUNTER_MASK: u8 = 0x1f;

/// Devices broadcast an announce report this often
pub const ANNOUNCE_INTERVAL_MS: u64 = 500;

/// A device missing three announce periods is considered gone
pub const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 1500;

/// An open pipe with no traffic for this long is failed with a timeout
pub const DEFAULT_PIPE_IDLE_TIMEOUT_MS: u64 = 30_000;

/// Default cap on concurrently open inbound pipes
pub const DEFAULT_MAX_OPEN_PIPES: usize = 64;

/// Only the low 4 bits of the announce restart counter are meaningful
pub const RESTART_COUNTER_MASK: u8 = 0x0f;

/// Announce flag: device supports the ACK protocol
pub const ANNOUNCE_FLAG_SUPPORTS_ACK: u8 = 0x01;

// Well-known service classes, from the service catalog.

/// Control service (service index 0 on every device)
pub const SRV_CONTROL: u32 = 0x0000_0000;
/// Logger service
pub const SRV_LOGGER: u32 = 0x12dc_1fca;
/// Accelerometer service
pub const SRV_ACCELEROMETER: u32 = 0x1f14_0409;
/// Button service
pub const SRV_BUTTON: u32 = 0x1473_a263;
/// Buzzer service
pub const SRV_BUZZER: u32 = 0x1b57_b1d7;
/// Slider (potentiometer) service
pub const SRV_SLIDER: u32 = 0x1f27_4746;
/// Thermometer service
pub const SRV_THERMOMETER: u32 = 0x1421_bac7;
/// Humidity service
pub const SRV_HUMIDITY: u32 = 0x16c8_10b8;
/// Role manager service
pub const SRV_ROLE_MANAGER: u32 = 0x119c_3ad1;
/// Settings (key-value store) service
pub const SRV_SETTINGS: u32 = 0x1107_dc4a;
/// TCP tunnel service
pub const SRV_TCP: u32 = 0x1b43_b70b;
/// WiFi management service
pub const SRV_WIFI: u32 = 0x18aa_e1fa;
