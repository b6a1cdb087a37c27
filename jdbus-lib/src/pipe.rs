use crate::constants::{
    MAX_PIPE_PORT, MAX_SERVICE_SIZE, PIPE_COUNTER_MASK, PIPE_DESCRIPTOR_SIZE, SERVICE_INDEX_PIPE,
};
use crate::error::JdError;
use crate::frame::Frame;
use bytes::Bytes;
use modular_bitfield::prelude::*;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The service_command word of a pipe frame.
#[bitfield(bytes = 2)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipeCommand {
    pub counter: B5,
    pub close: bool,
    pub metadata: bool,
    pub port: B9,
}

impl PipeCommand {
    pub fn from_command_word(word: u16) -> Self {
        Self::from_bytes(word.to_le_bytes())
    }

    pub fn to_command_word(self) -> u16 {
        u16::from_le_bytes(self.into_bytes())
    }
}

/// Wire layout of a pipe descriptor carried in command payloads.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PipeDescriptorRaw {
    pub device_id: U64, // pipe host
    pub port: U16,      //
    pub reserved: U16,  //
}

/// A pipe endpoint: the host device that owns the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeDescriptor {
    pub device_id: u64,
    pub port: u16,
}

impl PipeDescriptor {
    pub fn from_payload(payload: &[u8]) -> Result<Self, JdError> {
        if payload.len() != PIPE_DESCRIPTOR_SIZE {
            return Err(JdError::InvalidPipeDescriptor(format!(
                "expected {PIPE_DESCRIPTOR_SIZE} bytes, got {}",
                payload.len()
            )));
        }
        let raw = PipeDescriptorRaw::ref_from_bytes(payload)
            .map_err(|_| JdError::InvalidPipeDescriptor("bad layout".to_string()))?;
        let port = raw.port.get();
        if port > MAX_PIPE_PORT {
            return Err(JdError::InvalidPipeDescriptor(format!(
                "port {port} exceeds 9 bits"
            )));
        }
        Ok(PipeDescriptor {
            device_id: raw.device_id.get(),
            port,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let raw = PipeDescriptorRaw {
            device_id: U64::new(self.device_id),
            port: U16::new(self.port),
            reserved: U16::new(0),
        };
        Bytes::copy_from_slice(raw.as_bytes())
    }
}

/// Why an inbound pipe stopped producing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeClose {
    /// The sender closed the pipe normally.
    Done,
    /// No traffic arrived within the idle timeout.
    Timeout,
    /// A frame arrived with an unexpected counter; data was lost.
    OutOfOrder { expected: u8, received: u8 },
}

/// One delivery on an inbound pipe. Every pipe ends with exactly one `End`.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeChunk {
    Data(Bytes),
    Meta(Bytes),
    End(PipeClose),
}

/// Consumer half of an inbound pipe. Dropping it cancels the pipe.
#[derive(Debug)]
pub struct PipeHandle {
    pub device_id: u64,
    pub port: u16,
    rx: mpsc::UnboundedReceiver<PipeChunk>,
}

impl PipeHandle {
    pub async fn recv(&mut self) -> Option<PipeChunk> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PipeChunk> {
        self.rx.try_recv().ok()
    }

    /// Concatenate data chunks until the pipe ends, skipping metadata.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, JdError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            match chunk {
                PipeChunk::Data(b) => out.extend_from_slice(&b),
                PipeChunk::Meta(_) => {}
                PipeChunk::End(PipeClose::Done) => return Ok(out),
                PipeChunk::End(PipeClose::Timeout) => return Err(JdError::PipeTimeout),
                PipeChunk::End(PipeClose::OutOfOrder { expected, received }) => {
                    return Err(JdError::PipeOutOfOrder { expected, received });
                }
            }
        }
        Err(JdError::ChannelClosed)
    }
}

/// What became of one inbound pipe frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeFrameOutcome {
    Delivered,
    Closed,
    OutOfOrder,
    /// Consumer dropped its handle; the pipe is gone.
    Cancelled,
    UnknownPort(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Open,
    Streaming,
}

#[derive(Debug)]
struct InboundPipe {
    state: PipeState,
    next_counter: u8,
    last_rx_ms: u64,
    tx: mpsc::UnboundedSender<PipeChunk>,
}

/// Reassembles pipe frames into ordered per-pipe chunk streams.
///
/// Pipes are keyed by (host device id, port). Frames must arrive with
/// consecutive counters; a gap closes the pipe with an `OutOfOrder` fault
/// rather than waiting for data the bus will never resend.
#[derive(Debug)]
pub struct PipeAssembler {
    pipes: HashMap<(u64, u16), InboundPipe>,
    idle_timeout_ms: u64,
    max_open: usize,
    next_port: u16,
}

impl PipeAssembler {
    pub fn new(idle_timeout_ms: u64, max_open: usize) -> Self {
        PipeAssembler {
            pipes: HashMap::new(),
            idle_timeout_ms,
            max_open,
            next_port: 1,
        }
    }

    /// Allocate a port on `host_device_id` and hand back its consumer half.
    pub fn open(
        &mut self,
        host_device_id: u64,
        now_ms: u64,
    ) -> Result<(PipeDescriptor, PipeHandle), JdError> {
        if self.pipes.len() >= self.max_open {
            return Err(JdError::PipeLimitReached {
                limit: self.max_open,
            });
        }
        let port = self.allocate_port(host_device_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.pipes.insert(
            (host_device_id, port),
            InboundPipe {
                state: PipeState::Open,
                next_counter: 0,
                last_rx_ms: now_ms,
                tx,
            },
        );
        debug!("pipe {:016x}:{} opened", host_device_id, port);
        Ok((
            PipeDescriptor {
                device_id: host_device_id,
                port,
            },
            PipeHandle {
                device_id: host_device_id,
                port,
                rx,
            },
        ))
    }

    fn allocate_port(&mut self, host: u64) -> Result<u16, JdError> {
        for _ in 0..MAX_PIPE_PORT {
            let port = self.next_port;
            self.next_port = if self.next_port >= MAX_PIPE_PORT {
                1
            } else {
                self.next_port + 1
            };
            if !self.pipes.contains_key(&(host, port)) {
                return Ok(port);
            }
        }
        Err(JdError::PipeLimitReached {
            limit: MAX_PIPE_PORT as usize,
        })
    }

    /// Route one pipe frame (a command on the pipe service index).
    pub fn handle_frame(&mut self, frame: &Frame, now_ms: u64) -> PipeFrameOutcome {
        let cmd = PipeCommand::from_command_word(frame.service_command);
        let port = cmd.port();
        let key = (frame.device_id, port);
        let Some(pipe) = self.pipes.get_mut(&key) else {
            return PipeFrameOutcome::UnknownPort(port);
        };

        let received = cmd.counter();
        if received != pipe.next_counter {
            warn!(
                "pipe {:016x}:{} out of order: expected {}, received {}",
                frame.device_id, port, pipe.next_counter, received
            );
            let _ = pipe.tx.send(PipeChunk::End(PipeClose::OutOfOrder {
                expected: pipe.next_counter,
                received,
            }));
            self.pipes.remove(&key);
            return PipeFrameOutcome::OutOfOrder;
        }
        pipe.next_counter = (received + 1) & PIPE_COUNTER_MASK;
        pipe.last_rx_ms = now_ms;
        pipe.state = PipeState::Streaming;

        let mut delivered = true;
        if !frame.payload.is_empty() {
            let chunk = if cmd.metadata() {
                PipeChunk::Meta(frame.payload.clone())
            } else {
                PipeChunk::Data(frame.payload.clone())
            };
            delivered = pipe.tx.send(chunk).is_ok();
        }
        if cmd.close() {
            let _ = pipe.tx.send(PipeChunk::End(PipeClose::Done));
            self.pipes.remove(&key);
            debug!("pipe {:016x}:{} closed", frame.device_id, port);
            return PipeFrameOutcome::Closed;
        }
        if !delivered {
            debug!("pipe {:016x}:{} cancelled by consumer", frame.device_id, port);
            self.pipes.remove(&key);
            return PipeFrameOutcome::Cancelled;
        }
        PipeFrameOutcome::Delivered
    }

    /// Fail pipes with no traffic inside the idle timeout. Each failed pipe
    /// gets exactly one `End(Timeout)` chunk.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let timeout = self.idle_timeout_ms;
        let mut timed_out = 0;
        self.pipes.retain(|(device_id, port), pipe| {
            if now_ms.saturating_sub(pipe.last_rx_ms) > timeout {
                if pipe.state == PipeState::Open {
                    warn!("pipe {:016x}:{} timed out before any data", device_id, port);
                } else {
                    warn!("pipe {:016x}:{} idle timeout", device_id, port);
                }
                let _ = pipe.tx.send(PipeChunk::End(PipeClose::Timeout));
                timed_out += 1;
                false
            } else {
                true
            }
        });
        timed_out
    }

    pub fn open_count(&self) -> usize {
        self.pipes.len()
    }
}

/// Sender half of an outbound pipe, fragmenting writes into pipe frames.
///
/// The caller transmits the produced frames itself; this type only tracks
/// the counter and close state.
#[derive(Debug)]
pub struct OutPipe {
    device_id: u64,
    port: u16,
    next_counter: u8,
    closed: bool,
}

impl OutPipe {
    /// Wrap a descriptor received from the pipe host.
    pub fn new(descriptor: &PipeDescriptor) -> Result<Self, JdError> {
        if descriptor.port > MAX_PIPE_PORT {
            return Err(JdError::InvalidPipeDescriptor(format!(
                "port {} exceeds 9 bits",
                descriptor.port
            )));
        }
        Ok(OutPipe {
            device_id: descriptor.device_id,
            port: descriptor.port,
            next_counter: 0,
            closed: false,
        })
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_frame(&mut self, payload: Bytes, metadata: bool, close: bool) -> Result<Frame, JdError> {
        if self.closed {
            return Err(JdError::PipeClosed);
        }
        if payload.len() > MAX_SERVICE_SIZE {
            return Err(JdError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_SERVICE_SIZE,
            });
        }
        let word = PipeCommand::new()
            .with_counter(self.next_counter)
            .with_close(close)
            .with_metadata(metadata)
            .with_port(self.port)
            .to_command_word();
        self.next_counter = (self.next_counter + 1) & PIPE_COUNTER_MASK;
        if close {
            self.closed = true;
        }
        Ok(Frame::command(
            self.device_id,
            SERVICE_INDEX_PIPE,
            word,
            payload,
        ))
    }

    pub fn data_frame(&mut self, payload: Bytes) -> Result<Frame, JdError> {
        self.next_frame(payload, false, false)
    }

    pub fn meta_frame(&mut self, payload: Bytes) -> Result<Frame, JdError> {
        self.next_frame(payload, true, false)
    }

    pub fn close_frame(&mut self) -> Result<Frame, JdError> {
        self.next_frame(Bytes::new(), false, true)
    }

    /// Fragment `data` into as many data frames as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<Vec<Frame>, JdError> {
        data.chunks(MAX_SERVICE_SIZE)
            .map(|c| self.data_frame(Bytes::copy_from_slice(c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_word_bit_layout() {
        let cmd = PipeCommand::new()
            .with_counter(3)
            .with_close(true)
            .with_metadata(false)
            .with_port(5);
        assert_eq!(cmd.to_command_word(), 0x02a3);

        let parsed = PipeCommand::from_command_word(0x02a3);
        assert_eq!(parsed.counter(), 3);
        assert!(parsed.close());
        assert!(!parsed.metadata());
        assert_eq!(parsed.port(), 5);
    }

    #[test]
    fn descriptor_wire_layout() {
        let d = PipeDescriptor {
            device_id: 0x1122334455667788,
            port: 0x1ff,
        };
        let payload = d.to_payload();
        assert_eq!(
            payload.as_ref(),
            &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xff, 0x01, 0x00, 0x00]
        );
        assert_eq!(PipeDescriptor::from_payload(&payload).unwrap(), d);
    }

    #[test]
    fn descriptor_rejects_wrong_sizes() {
        assert!(PipeDescriptor::from_payload(&[0u8; 11]).is_err());
        assert!(PipeDescriptor::from_payload(&[0u8; 13]).is_err());
        let mut bad_port = [0u8; 12];
        bad_port[8] = 0x00;
        bad_port[9] = 0x02; // port 0x200
        assert!(PipeDescriptor::from_payload(&bad_port).is_err());
    }

    #[test]
    fn out_pipe_counter_wraps() {
        let d = PipeDescriptor {
            device_id: 0xd0,
            port: 1,
        };
        let mut pipe = OutPipe::new(&d).unwrap();
        for i in 0..32 {
            let frame = pipe.data_frame(Bytes::from_static(b"x")).unwrap();
            let cmd = PipeCommand::from_command_word(frame.service_command);
            assert_eq!(cmd.counter(), i as u8);
        }
        let frame = pipe.data_frame(Bytes::from_static(b"x")).unwrap();
        assert_eq!(
            PipeCommand::from_command_word(frame.service_command).counter(),
            0
        );
    }

    #[test]
    fn out_pipe_rejects_writes_after_close() {
        let d = PipeDescriptor {
            device_id: 0xd0,
            port: 7,
        };
        let mut pipe = OutPipe::new(&d).unwrap();
        let close = pipe.close_frame().unwrap();
        assert!(PipeCommand::from_command_word(close.service_command).close());
        assert!(matches!(
            pipe.data_frame(Bytes::from_static(b"x")),
            Err(JdError::PipeClosed)
        ));
    }

    #[test]
    fn write_fragments_large_buffers() {
        let d = PipeDescriptor {
            device_id: 0xd0,
            port: 1,
        };
        let mut pipe = OutPipe::new(&d).unwrap();
        let data = vec![0xabu8; 500];
        let frames = pipe.write(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), MAX_SERVICE_SIZE);
        assert_eq!(frames[1].payload.len(), MAX_SERVICE_SIZE);
        assert_eq!(frames[2].payload.len(), 500 - 2 * MAX_SERVICE_SIZE);
        let total: usize = frames.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, 500);
    }
}
