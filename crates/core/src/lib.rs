pub mod config;
pub mod cursor;
pub mod error;
pub mod hlc;
pub mod identity;
pub mod ids;
pub mod registry;
pub mod setting_value;

pub use config::SyncConfig;
pub use cursor::Cursor;
pub use error::CoreError;
pub use hlc::Hlc;
pub use identity::{IdentityProvider, User};
pub use ids::*;
pub use registry::{SettingDescriptor, SettingsRegistry, TransportMode};
pub use setting_value::SettingValue;
