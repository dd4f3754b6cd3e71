use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::ids::StoreGeneration;

/// Client-held watermark: the newest `modified_at` a session has processed,
/// scoped to the store generation that issued it.
///
/// A cursor from another generation is stale; the store was reset and the
/// session must reconnect instead of pulling against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub generation: StoreGeneration,
    pub position: Hlc,
}

impl Cursor {
    pub fn new(generation: StoreGeneration, position: Hlc) -> Self {
        Self {
            generation,
            position,
        }
    }

    /// Move forward to `next`. Never rewinds and never crosses generations;
    /// returns whether the cursor moved.
    pub fn advance_to(&mut self, next: &Cursor) -> bool {
        if next.generation != self.generation || next.position <= self.position {
            return false;
        }
        self.position = next.position;
        true
    }
}
