use std::sync::Arc;

use tandem_core::hlc::ManualClock;
use tandem_core::identity::StaticDirectory;
use tandem_core::registry::{SettingDescriptor, StaticRegistry};
use tandem_core::{CoreError, SettingId, SyncConfig, TransportMode, User};
use tandem_engine::{Coordinator, RequestContext, SyncError};
use tandem_storage::SqliteStore;

use crate::faulty::FaultyStore;
use crate::loopback::LoopbackChannel;
use crate::peer::TestPeer;

pub type HarnessStore = FaultyStore<SqliteStore>;
pub type HarnessCoordinator = Coordinator<HarnessStore>;

/// Wall time every network starts at.
pub const START_MS: u64 = 1_700_000_000_000;

pub fn setting(id: &str) -> Result<SettingId, CoreError> {
    SettingId::new(id)
}

/// Settings every test network registers.
pub fn default_registry() -> Result<StaticRegistry, CoreError> {
    let registry = StaticRegistry::new();
    registry.register(
        setting("blogname")?,
        SettingDescriptor::leaf("option").with_transport(TransportMode::Live),
    );
    registry.register(setting("color")?, SettingDescriptor::leaf("theme_mod"));
    registry.register(setting("logo")?, SettingDescriptor::leaf("theme_mod"));
    registry.register(
        setting("title")?,
        SettingDescriptor::leaf("option").with_transport(TransportMode::Live),
    );
    registry.register(setting("widget_text[2]")?, SettingDescriptor::leaf("widget"));
    registry.register(setting("widget_text[3]")?, SettingDescriptor::leaf("widget"));
    registry.register(
        setting("sidebars_widgets[sidebar-1]")?,
        SettingDescriptor::composite("sidebar"),
    );
    Ok(registry)
}

/// One coordinator shared by every peer, on a manual clock.
pub struct TestNetwork {
    coordinator: Arc<HarnessCoordinator>,
    clock: Arc<ManualClock>,
    directory: Arc<StaticDirectory>,
    registry: Arc<StaticRegistry>,
}

impl TestNetwork {
    pub fn new() -> Result<Self, SyncError> {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Result<Self, SyncError> {
        let clock = ManualClock::new(START_MS);
        let store = SqliteStore::open_in_memory_with_clock(clock.clone())?;
        Self::assemble(store, clock, config)
    }

    /// A network over an on-disk store, for restart tests.
    pub fn open(path: &str, clock: Arc<ManualClock>, config: SyncConfig) -> Result<Self, SyncError> {
        let store = SqliteStore::open_with_clock(path, clock.clone())?;
        Self::assemble(store, clock, config)
    }

    fn assemble(
        store: SqliteStore,
        clock: Arc<ManualClock>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let directory = Arc::new(StaticDirectory::new());
        let registry = Arc::new(default_registry()?);
        let coordinator = Coordinator::new(
            FaultyStore::new(store),
            directory.clone(),
            registry.clone(),
            config,
        )?;
        Ok(Self {
            coordinator: Arc::new(coordinator),
            clock,
            directory,
            registry,
        })
    }

    pub fn coordinator(&self) -> &Arc<HarnessCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &HarnessStore {
        self.coordinator.store()
    }

    pub fn registry(&self) -> &Arc<StaticRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<StaticDirectory> {
        &self.directory
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.get_ms()
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.clock.advance_ms(ms)
    }

    /// Register a user holding the editing capability.
    pub fn add_user(&self, name: &str) -> User {
        let user = User::new(name);
        let capability = self.coordinator.config().capability.clone();
        self.directory.insert(user.clone(), &[capability.as_str()]);
        user
    }

    pub fn add_user_without_capability(&self, name: &str) -> User {
        let user = User::new(name);
        self.directory.insert(user.clone(), &[]);
        user
    }

    pub fn context(&self, user: &User) -> RequestContext {
        RequestContext::authenticated(user.id)
    }

    pub fn channel(&self, user: &User) -> LoopbackChannel {
        LoopbackChannel::new(self.coordinator.clone(), self.context(user))
    }

    /// A client session for `user`, not yet connected.
    pub fn peer(&self, user: &User) -> TestPeer {
        TestPeer::new(
            user.clone(),
            self.channel(user),
            self.registry.clone(),
            self.coordinator.config().clone(),
            self.clock.clone(),
        )
    }

    /// A client session for `user`, connected.
    pub fn join(&self, user: &User) -> Result<TestPeer, tandem_client::ClientError> {
        let mut peer = self.peer(user);
        peer.connect()?;
        Ok(peer)
    }
}
