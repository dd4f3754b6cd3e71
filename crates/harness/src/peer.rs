use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tandem_client::{
    ClientError, ClientEvent, ClientSession, EditOutcome, JsonTransport, LockInfo, Phase,
};
use tandem_core::hlc::ManualClock;
use tandem_core::{SettingId, SettingValue, SettingsRegistry, SyncConfig, User};
use tandem_engine::PublishReport;

use crate::loopback::LoopbackChannel;

pub type PeerSession = ClientSession<JsonTransport<LoopbackChannel>>;

/// One client session plus a record of every event it emitted. All calls
/// read the network's manual clock.
pub struct TestPeer {
    pub user: User,
    session: PeerSession,
    clock: Arc<ManualClock>,
    events: Rc<RefCell<Vec<ClientEvent>>>,
}

impl TestPeer {
    pub fn new(
        user: User,
        channel: LoopbackChannel,
        registry: Arc<dyn SettingsRegistry>,
        config: SyncConfig,
        clock: Arc<ManualClock>,
    ) -> Self {
        let mut session = ClientSession::new(JsonTransport::new(channel), registry, config);
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        session.subscribe(move |event| sink.borrow_mut().push(event.clone()));
        Self {
            user,
            session,
            clock,
            events,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.get_ms()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut PeerSession {
        &mut self.session
    }

    pub fn channel(&self) -> &LoopbackChannel {
        self.session.transport().channel()
    }

    pub fn channel_mut(&mut self) -> &mut LoopbackChannel {
        self.session.transport_mut().channel_mut()
    }

    pub fn seed(&mut self, committed: impl IntoIterator<Item = (SettingId, SettingValue)>) {
        self.session.seed(committed);
    }

    pub fn connect(&mut self) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.connect(now)
    }

    pub fn edit(&mut self, setting_id: &SettingId, value: impl Into<SettingValue>) -> EditOutcome {
        let now = self.now_ms();
        self.session.edit(setting_id.clone(), value.into(), now)
    }

    pub fn tick(&mut self) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.tick(now)
    }

    pub fn flush(&mut self) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.flush(now)
    }

    pub fn heartbeat(&mut self) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.heartbeat(now)
    }

    pub fn publish(&mut self) -> Result<PublishReport, ClientError> {
        let now = self.now_ms();
        self.session.publish(now)
    }

    pub fn override_lock(&mut self, setting_id: &SettingId) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.override_lock(setting_id, now)
    }

    pub fn accept_theirs(&mut self, setting_id: &SettingId) -> Result<(), ClientError> {
        let now = self.now_ms();
        self.session.accept_theirs(setting_id, now)
    }

    pub fn phase(&self, setting_id: &SettingId) -> Phase {
        self.session.phase(setting_id)
    }

    pub fn displayed(&self, setting_id: &SettingId) -> Option<SettingValue> {
        self.session.displayed(setting_id).cloned()
    }

    pub fn lock(&self, setting_id: &SettingId) -> Option<LockInfo> {
        self.session.machine().lock(setting_id).cloned()
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.borrow().clone()
    }

    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}
