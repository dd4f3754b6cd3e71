use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Author information attached to records and locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl User {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Placeholder for an author the provider no longer knows about.
    pub fn unknown(id: UserId) -> Self {
        Self {
            id,
            display_name: String::new(),
            avatar_ref: None,
        }
    }
}

/// Identity and authorization collaborator.
pub trait IdentityProvider: Send + Sync {
    fn user(&self, id: UserId) -> Option<User>;

    fn can_edit(&self, id: UserId, capability: &str) -> bool;
}

/// In-memory provider: a user table plus the capabilities granted to each user.
#[derive(Default)]
pub struct StaticDirectory {
    users: RwLock<BTreeMap<UserId, (User, BTreeSet<String>)>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User, capabilities: &[&str]) {
        let caps = capabilities.iter().map(|c| c.to_string()).collect();
        self.users.write().insert(user.id, (user, caps));
    }

    pub fn revoke(&self, id: UserId, capability: &str) {
        if let Some((_, caps)) = self.users.write().get_mut(&id) {
            caps.remove(capability);
        }
    }
}

impl IdentityProvider for StaticDirectory {
    fn user(&self, id: UserId) -> Option<User> {
        self.users.read().get(&id).map(|(user, _)| user.clone())
    }

    fn can_edit(&self, id: UserId, capability: &str) -> bool {
        self.users
            .read()
            .get(&id)
            .is_some_and(|(_, caps)| caps.contains(capability))
    }
}
