pub mod config;
pub mod hub;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod telemetry;

pub use hub::{Hub, HubConfig};
pub use notify::PresenceDirectory;
