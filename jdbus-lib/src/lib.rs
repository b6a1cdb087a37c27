pub mod bus;
pub mod client;
pub mod constants;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod pack;
pub mod pipe;
pub mod registry;

// Re-export the main entry points for easy access
pub use bus::{Bus, BusConfig, BusStats};
pub use client::{BusClient, FrameSender};
pub use error::JdError;
pub use frame::Frame;
pub use pack::{PayloadFormat, Value};
pub use registry::Registry;
