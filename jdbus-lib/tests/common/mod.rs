//! Common test utilities and shared imports

// Allow unused imports and dead code since this is a shared module
// used across multiple test files - not all items are used in every test file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use jdbus_lib::bus::{Bus, BusConfig, BusStats};
#[allow(unused_imports)]
pub use jdbus_lib::constants::*;
#[allow(unused_imports)]
pub use jdbus_lib::device::{Announce, DeviceChange};
#[allow(unused_imports)]
pub use jdbus_lib::dispatch::{CommandKind, Dispatch, DispatchMiss, EventNotification};
#[allow(unused_imports)]
pub use jdbus_lib::error::JdError;
#[allow(unused_imports)]
pub use jdbus_lib::frame::Frame;
#[allow(unused_imports)]
pub use jdbus_lib::pack::{PayloadFormat, Value};
#[allow(unused_imports)]
pub use jdbus_lib::pipe::{PipeChunk, PipeClose, PipeCommand, PipeDescriptor};
#[allow(unused_imports)]
pub use jdbus_lib::registry::Registry;

#[allow(dead_code)]
pub const DEV_A: u64 = 0x1122_3344_5566_7788;
#[allow(dead_code)]
pub const DEV_B: u64 = 0x99aa_bbcc_ddee_ff00;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// A bus over the built-in catalog with default limits
#[allow(dead_code)]
pub fn core_bus() -> Bus {
    Bus::with_core_registry().expect("core catalog should load")
}

/// Announce report binding `classes` to service indices 1.. on `device_id`
#[allow(dead_code)]
pub fn announce_frame(device_id: u64, restart_counter: u8, classes: &[u32]) -> Frame {
    let announce = Announce {
        restart_counter,
        flags: 0,
        packet_count: 0,
        service_classes: classes.to_vec(),
    };
    Frame::report(
        device_id,
        SERVICE_INDEX_CONTROL,
        0x0000,
        announce.to_payload(),
    )
}

/// Encoded wire bytes for a frame
#[allow(dead_code)]
pub fn wire(frame: &Frame) -> Vec<u8> {
    frame.encode().expect("frame should encode").to_vec()
}

/// A pipe frame addressed to `host` carrying `counter` on `port`
#[allow(dead_code)]
pub fn pipe_frame(host: u64, port: u16, counter: u8, close: bool, payload: &[u8]) -> Frame {
    let word = PipeCommand::new()
        .with_counter(counter)
        .with_close(close)
        .with_metadata(false)
        .with_port(port)
        .to_command_word();
    Frame::command(
        host,
        SERVICE_INDEX_PIPE,
        word,
        Bytes::copy_from_slice(payload),
    )
}
