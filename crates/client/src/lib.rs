pub mod error;
pub mod events;
pub mod machine;
pub mod session;
pub mod transport;

pub use error::{ClientError, TransportError};
pub use events::{ClientEvent, EventBus, SubscriptionId};
pub use machine::{EditOutcome, LockInfo, Phase, SyncMachine};
pub use session::ClientSession;
pub use transport::{JsonChannel, JsonTransport, SyncTransport};
