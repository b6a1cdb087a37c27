use crate::bus::Bus;
use crate::constants::{CMD_GET_REGISTER, CMD_SET_REGISTER, REGISTER_CODE_MASK};
use crate::dispatch::Dispatch;
use crate::error::JdError;
use crate::frame::Frame;
use crate::pack::Value;
use crate::pipe::PipeHandle;
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Outbound half of a bus transport.
#[allow(async_fn_in_trait)]
pub trait FrameSender {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), JdError>;
}

/// Channel transport, for tests and in-process wiring.
impl FrameSender for mpsc::UnboundedSender<Frame> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), JdError> {
        self.send(frame).map_err(|_| JdError::ChannelClosed)
    }
}

/// Request/response edge over a shared [`Bus`].
///
/// The client owns the clock: it stamps inbound frames in `feed` and expiry
/// checks in `tick` with milliseconds since its own construction, and bounds
/// every awaited report with a timeout. The bus stays synchronous
/// underneath; only the waiting happens here.
pub struct BusClient<S> {
    bus: Arc<Mutex<Bus>>,
    sender: S,
    timeout: Duration,
    epoch: Instant,
}

impl<S: FrameSender> BusClient<S> {
    pub fn new(bus: Arc<Mutex<Bus>>, sender: S) -> Self {
        BusClient {
            bus,
            sender,
            timeout: DEFAULT_REPORT_TIMEOUT,
            epoch: Instant::now(),
        }
    }

    /// Replace the per-request report timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bus(&self) -> Arc<Mutex<Bus>> {
        Arc::clone(&self.bus)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn lock(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock().expect("bus lock poisoned")
    }

    /// Feed one raw frame from the transport into the engine.
    pub fn feed(&self, raw: &[u8]) {
        let now = self.now_ms();
        self.lock().process(raw, now);
    }

    /// Run device expiry and pipe idle checks; call periodically.
    pub fn tick(&self) {
        let now = self.now_ms();
        self.lock().sweep(now);
    }

    /// Read a register and await the matching report.
    pub async fn get_register(
        &mut self,
        device_id: u64,
        service_index: u8,
        register: u16,
    ) -> Result<Dispatch, JdError> {
        let command = CMD_GET_REGISTER | (register & REGISTER_CODE_MASK);
        self.request(device_id, service_index, command, Bytes::new())
            .await
    }

    /// Write a register, packing `values` with its registry format.
    ///
    /// Needs the device announced (to know the class) and the register known
    /// to the registry (to know the format); otherwise there is no way to
    /// turn values into bytes.
    pub async fn set_register(
        &mut self,
        device_id: u64,
        service_index: u8,
        register: u16,
        values: &[Value],
    ) -> Result<(), JdError> {
        let payload = self.pack_register(device_id, service_index, register, values)?;
        let command = CMD_SET_REGISTER | (register & REGISTER_CODE_MASK);
        self.sender
            .send_frame(Frame::command(device_id, service_index, command, payload))
            .await
    }

    /// Send an action command and await its same-code report.
    pub async fn call(
        &mut self,
        device_id: u64,
        service_index: u8,
        command: u16,
        payload: Bytes,
    ) -> Result<Dispatch, JdError> {
        self.request(device_id, service_index, command, payload)
            .await
    }

    /// Fire-and-forget command.
    pub async fn send_command(
        &mut self,
        device_id: u64,
        service_index: u8,
        command: u16,
        payload: Bytes,
    ) -> Result<(), JdError> {
        self.sender
            .send_frame(Frame::command(device_id, service_index, command, payload))
            .await
    }

    /// Open an inbound pipe and ask the device to stream into it: `command`
    /// is sent with the pipe descriptor as its payload.
    pub async fn open_pipe(
        &mut self,
        device_id: u64,
        service_index: u8,
        command: u16,
    ) -> Result<PipeHandle, JdError> {
        let now = self.now_ms();
        let (descriptor, handle) = self.lock().open_pipe(now)?;
        self.sender
            .send_frame(Frame::command(
                device_id,
                service_index,
                command,
                descriptor.to_payload(),
            ))
            .await?;
        Ok(handle)
    }

    async fn request(
        &mut self,
        device_id: u64,
        service_index: u8,
        command: u16,
        payload: Bytes,
    ) -> Result<Dispatch, JdError> {
        let rx = self.lock().watch_report(device_id, service_index, command);
        self.sender
            .send_frame(Frame::command(device_id, service_index, command, payload))
            .await?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(dispatch)) => Ok(dispatch),
            Ok(Err(_)) => Err(JdError::ChannelClosed),
            Err(_) => {
                self.lock()
                    .unwatch_report(device_id, service_index, command);
                Err(JdError::ReportTimeout)
            }
        }
    }

    fn pack_register(
        &self,
        device_id: u64,
        service_index: u8,
        register: u16,
        values: &[Value],
    ) -> Result<Bytes, JdError> {
        let bus = self.lock();
        let class = bus
            .devices()
            .service_class(device_id, service_index)
            .ok_or(JdError::ServiceUnresolved {
                device_id,
                service_index,
            })?;
        let entry =
            bus.registry()
                .register(class, register)
                .ok_or(JdError::SpecMissing {
                    service_class: class,
                    code: register,
                })?;
        entry.format.pack(values)
    }
}
