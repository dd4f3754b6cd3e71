use tandem_core::{Cursor, SettingId, SettingValue, User};

/// Notifications a client session emits as settings change state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Another user holds the setting. `cascade` is set when the lock comes
    /// from a locked member of a composite setting.
    Locked {
        setting_id: SettingId,
        by: User,
        cascade: bool,
    },
    Unlocked {
        setting_id: SettingId,
        reload_required: bool,
    },
    /// The displayed value changed because of a remote update, an unlock or
    /// a lock expiry.
    ValueApplied {
        setting_id: SettingId,
        value: SettingValue,
        reload_required: bool,
    },
    PreviewAccepted {
        setting_id: SettingId,
        revision: u64,
        overridden: bool,
    },
    PreviewRejected {
        setting_id: SettingId,
        locked_by: User,
        their_value: SettingValue,
    },
    PublishConflict {
        setting_id: SettingId,
        their_value: SettingValue,
        their_author: User,
    },
    Published {
        setting_id: SettingId,
        revision: u64,
    },
    SendFailed {
        setting_id: Option<SettingId>,
        reason: String,
        retryable: bool,
    },
    LockExpired {
        setting_id: SettingId,
    },
    CursorReset {
        cursor: Cursor,
    },
}

impl ClientEvent {
    pub fn setting_id(&self) -> Option<&SettingId> {
        match self {
            Self::Locked { setting_id, .. }
            | Self::Unlocked { setting_id, .. }
            | Self::ValueApplied { setting_id, .. }
            | Self::PreviewAccepted { setting_id, .. }
            | Self::PreviewRejected { setting_id, .. }
            | Self::PublishConflict { setting_id, .. }
            | Self::Published { setting_id, .. }
            | Self::LockExpired { setting_id } => Some(setting_id),
            Self::SendFailed { setting_id, .. } => setting_id.as_ref(),
            Self::CursorReset { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&ClientEvent)>;

/// Synchronous fan-out of [`ClientEvent`]s, in subscription order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&ClientEvent) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn publish(&mut self, event: &ClientEvent) {
        for (_, subscriber) in &mut self.subscribers {
            subscriber(event);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn publish_reaches_subscribers_until_unsubscribed() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let id = bus.subscribe(move |event| sink.borrow_mut().push(event.clone()));

        let event = ClientEvent::LockExpired {
            setting_id: SettingId::new("color").unwrap(),
        };
        bus.publish(&event);
        assert_eq!(seen.borrow().as_slice(), &[event.clone()]);
        assert_eq!(event.setting_id().unwrap().as_str(), "color");

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&event);
        assert_eq!(seen.borrow().len(), 1);
        assert!(bus.is_empty());
    }
}
