//! In-process test rig: one shared coordinator, any number of client
//! sessions talking to it through the JSON wire codec, a manual clock, and
//! a store that can be told to fail.

pub mod faulty;
pub mod logging;
pub mod loopback;
pub mod network;
pub mod peer;

pub use faulty::FaultyStore;
pub use logging::init_tracing;
pub use loopback::LoopbackChannel;
pub use network::{HarnessCoordinator, HarnessStore, START_MS, TestNetwork, default_registry, setting};
pub use peer::{PeerSession, TestPeer};
