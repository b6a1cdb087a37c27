use crate::constants::{
    CMD_ANNOUNCE, CMD_EVENT, FRAME_FLAG_ACK_REQUESTED, FRAME_FLAG_COMMAND,
    FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS, FRAME_HEADER_SIZE, MAX_SERVICE_SIZE,
    SERVICE_INDEX_CONTROL, SERVICE_INDEX_PIPE,
};
use crate::error::JdError;
use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_16_IBM_3740, Crc};
use std::fmt;
use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xffff), as used by frame trailers.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over a frame buffer minus its two leading CRC bytes.
pub fn frame_crc(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Wire layout of the frame header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeaderRaw {
    pub crc: U16,             // over bytes 2.. of the full frame
    pub device_id: U64,       // or service class, see flags bit 2
    pub flags: u8,            //
    pub service_size: u8,     // payload length in bytes
    pub service_index: u8,    //
    pub service_command: U16, //
}

/// A validated bus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device_id: u64,
    pub flags: u8,
    pub service_index: u8,
    pub service_command: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Command frame bound for one device.
    pub fn command(device_id: u64, service_index: u8, service_command: u16, payload: Bytes) -> Self {
        Frame {
            device_id,
            flags: FRAME_FLAG_COMMAND,
            service_index,
            service_command,
            payload,
        }
    }

    /// Report frame emitted by a device.
    pub fn report(device_id: u64, service_index: u8, service_command: u16, payload: Bytes) -> Self {
        Frame {
            device_id,
            flags: 0,
            service_index,
            service_command,
            payload,
        }
    }

    /// Command frame addressed to every instance of a service class.
    pub fn multicast(service_class: u32, service_command: u16, payload: Bytes) -> Self {
        Frame {
            device_id: service_class as u64,
            flags: FRAME_FLAG_COMMAND | FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS,
            service_index: 0,
            service_command,
            payload,
        }
    }

    /// Mark this frame as wanting an ACK from its addressee.
    pub fn with_ack_requested(mut self) -> Self {
        self.flags |= FRAME_FLAG_ACK_REQUESTED;
        self
    }

    pub fn is_command(&self) -> bool {
        self.flags & FRAME_FLAG_COMMAND != 0
    }

    pub fn is_report(&self) -> bool {
        !self.is_command()
    }

    pub fn wants_ack(&self) -> bool {
        self.flags & FRAME_FLAG_ACK_REQUESTED != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.flags & FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0
    }

    /// The addressed service class, when this is a multicast command.
    pub fn multicast_class(&self) -> Option<u32> {
        self.is_multicast().then_some(self.device_id as u32)
    }

    /// True for the periodic control-service announce report.
    pub fn is_announce(&self) -> bool {
        self.is_report()
            && self.service_index == SERVICE_INDEX_CONTROL
            && self.service_command == CMD_ANNOUNCE
    }

    /// True for event reports, which carry `u32 event_id, u32 argument`.
    pub fn is_event(&self) -> bool {
        self.is_report() && self.service_command == CMD_EVENT
    }

    /// True for command frames on the reserved pipe service index.
    pub fn is_pipe(&self) -> bool {
        self.is_command() && !self.is_multicast() && self.service_index == SERVICE_INDEX_PIPE
    }

    /// Validate and decode a frame from raw bus bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, JdError> {
        let header = check_frame(buf)?;
        Ok(Frame {
            device_id: header.device_id.get(),
            flags: header.flags,
            service_index: header.service_index,
            service_command: header.service_command.get(),
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..]),
        })
    }

    /// Serialize, computing `service_size` and the CRC.
    pub fn encode(&self) -> Result<Bytes, JdError> {
        if self.payload.len() > MAX_SERVICE_SIZE {
            return Err(JdError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_SERVICE_SIZE,
            });
        }
        let header = FrameHeaderRaw {
            crc: U16::new(0),
            device_id: U64::new(self.device_id),
            flags: self.flags,
            service_size: self.payload.len() as u8,
            service_index: self.service_index,
            service_command: U16::new(self.service_command),
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        let crc = frame_crc(&buf[2..]);
        buf[0..2].copy_from_slice(&crc.to_le_bytes());
        Ok(buf.freeze())
    }
}

impl TryFrom<Bytes> for Frame {
    type Error = JdError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let header = check_frame(&bytes)?;
        Ok(Frame {
            device_id: header.device_id.get(),
            flags: header.flags,
            service_index: header.service_index,
            service_command: header.service_command.get(),
            payload: bytes.slice(FRAME_HEADER_SIZE..),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:016x}/{} cmd={:#06x} [{}]",
            if self.is_command() { "cmd" } else { "rep" },
            self.device_id,
            self.service_index,
            self.service_command,
            hex::encode(&self.payload)
        )
    }
}

/// Shared validation: length, declared size and CRC.
fn check_frame(buf: &[u8]) -> Result<&FrameHeaderRaw, JdError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(JdError::FrameTooShort {
            expected: FRAME_HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let header = FrameHeaderRaw::ref_from_bytes(&buf[..FRAME_HEADER_SIZE]).map_err(|_| {
        JdError::FrameTooShort {
            expected: FRAME_HEADER_SIZE,
            actual: buf.len(),
        }
    })?;
    let declared = header.service_size as usize;
    if declared > MAX_SERVICE_SIZE {
        return Err(JdError::PayloadTooLarge {
            size: declared,
            max: MAX_SERVICE_SIZE,
        });
    }
    let actual = buf.len() - FRAME_HEADER_SIZE;
    if declared != actual {
        return Err(JdError::FrameLengthMismatch { declared, actual });
    }
    let computed = frame_crc(&buf[2..]);
    let stored = header.crc.get();
    if stored != computed {
        return Err(JdError::CrcMismatch { stored, computed });
    }
    Ok(header)
}
