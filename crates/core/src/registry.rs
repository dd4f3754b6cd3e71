use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::SettingId;
use crate::setting_value::SettingValue;

/// How a client surfaces a value change for this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// The preview must be reloaded in full.
    Refresh,
    /// The value can be patched into the running preview.
    Live,
}

impl TransportMode {
    pub fn requires_reload(&self) -> bool {
        matches!(self, Self::Refresh)
    }
}

pub const LEAF_PRIORITY: i32 = 0;
pub const COMPOSITE_PRIORITY: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingDescriptor {
    pub kind: String,
    pub transport: TransportMode,
    /// Delivery order within one batch of updates; lower first.
    pub priority: i32,
    /// Composite settings hold a list of member setting ids as their value.
    pub composite: bool,
}

impl SettingDescriptor {
    pub fn leaf(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            transport: TransportMode::Refresh,
            priority: LEAF_PRIORITY,
            composite: false,
        }
    }

    pub fn composite(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            transport: TransportMode::Refresh,
            priority: COMPOSITE_PRIORITY,
            composite: true,
        }
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Settings registry collaborator.
pub trait SettingsRegistry: Send + Sync {
    fn setting(&self, id: &SettingId) -> Option<SettingDescriptor>;

    /// Member ids a composite setting's value refers to. Empty for leaves.
    fn members(&self, id: &SettingId, value: &SettingValue) -> Vec<SettingId> {
        match self.setting(id) {
            Some(descriptor) if descriptor.composite => value.referenced_ids(),
            _ => Vec::new(),
        }
    }

    fn priority(&self, id: &SettingId) -> i32 {
        self.setting(id).map_or(LEAF_PRIORITY, |d| d.priority)
    }

    fn transport(&self, id: &SettingId) -> TransportMode {
        self.setting(id)
            .map_or(TransportMode::Refresh, |d| d.transport)
    }
}

#[derive(Default)]
pub struct StaticRegistry {
    settings: RwLock<BTreeMap<SettingId, SettingDescriptor>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SettingId, descriptor: SettingDescriptor) {
        self.settings.write().insert(id, descriptor);
    }

    pub fn len(&self) -> usize {
        self.settings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.read().is_empty()
    }
}

impl SettingsRegistry for StaticRegistry {
    fn setting(&self, id: &SettingId) -> Option<SettingDescriptor> {
        self.settings.read().get(id).cloned()
    }
}

/// Stable sort of items by the registry priority of their setting id, so
/// composites are applied after the members they reference.
pub fn sort_for_delivery<T>(
    registry: &dyn SettingsRegistry,
    items: &mut [T],
    id_of: impl Fn(&T) -> &SettingId,
) {
    items.sort_by_key(|item| registry.priority(id_of(item)));
}
