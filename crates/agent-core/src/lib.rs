//! Shared types, configuration and error definitions for the OTA agent and
//! its companion self-upgrader.

pub mod archive;
pub mod config;
pub mod error;
pub mod types;

pub use config::{load_config, save_default_config, Config};
pub use error::AgentError;
pub use types::{
    AgentDevicePayload, BindingState, DeviceBinding, Heartbeat, InboundMessage, OtaStatusMessage,
    UpgradeCommand, UpgradeStatus,
};
