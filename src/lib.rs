pub mod config;
pub mod core;
pub mod devices;
pub mod session;

// Re-export commonly used items for convenience
pub use config::{ConfigError, ConsultConfig};
pub use core::*;
pub use devices::{DeviceError, MediaBackend, MediaDevices};
pub use session::{Session, SessionConfig, SessionError, SessionErrorKind, SessionState, SessionStatus};
