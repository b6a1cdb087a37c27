use thiserror::Error;

/// Errors for the jdbus library
#[derive(Error, Debug)]
pub enum JdError {
    #[error("Frame too short: need at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("Frame length mismatch: header declares {declared} payload bytes, buffer has {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    #[error("Frame CRC mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    CrcMismatch { stored: u16, computed: u16 },

    #[error("Payload too large: {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Format error in `{format}`: {message}")]
    Format { format: String, message: String },

    #[error("Invalid announce payload: {0}")]
    InvalidAnnounce(String),

    #[error("Invalid pipe descriptor: {0}")]
    InvalidPipeDescriptor(String),

    #[error("Invalid registry: {0}")]
    InvalidRegistry(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pipe timed out waiting for data")]
    PipeTimeout,

    #[error("Pipe data out of order: expected counter {expected}, received {received}")]
    PipeOutOfOrder { expected: u8, received: u8 },

    #[error("Pipe is closed")]
    PipeClosed,

    #[error("Too many open pipes (limit {limit})")]
    PipeLimitReached { limit: usize },

    #[error("Timed out waiting for a report")]
    ReportTimeout,

    #[error("Channel closed before completion")]
    ChannelClosed,

    #[error("No announce binding for device {device_id:#018x} service index {service_index}")]
    ServiceUnresolved { device_id: u64, service_index: u8 },

    #[error("No registry entry for service class {service_class:#010x} code {code:#06x}")]
    SpecMissing { service_class: u32, code: u16 },
}

impl JdError {
    /// Shorthand for a format-string error tied to its source text.
    pub fn format(format: &str, message: impl Into<String>) -> Self {
        JdError::Format {
            format: format.to_string(),
            message: message.into(),
        }
    }

    /// True for errors produced while validating a raw frame buffer.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            JdError::FrameTooShort { .. }
                | JdError::FrameLengthMismatch { .. }
                | JdError::CrcMismatch { .. }
                | JdError::PayloadTooLarge { .. }
        )
    }
}
