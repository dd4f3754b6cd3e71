//! Decides whether a preview or publish may be written over the record that
//! currently holds a setting.
//!
//! Pure: the caller gathers the existing record, the session cursor and the
//! store time, and acts on the returned [`Resolution`].

use tandem_core::{Hlc, UserId, ValueDigest};
use tandem_storage::PreviewedSettingRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    /// Would have been rejected or conflicted, but the caller asked to
    /// override.
    Overridden,
    /// Preview blocked by a live foreign draft.
    Rejected,
    /// Publish blocked by a foreign write the session has not seen.
    Conflict,
}

impl Resolution {
    /// Whether the candidate may be written.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Accepted | Self::Overridden)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveInput<'a> {
    pub candidate_digest: ValueDigest,
    /// Newest `modified_at` the submitting session has processed.
    pub client_cursor: Hlc,
    pub existing: Option<&'a PreviewedSettingRecord>,
    pub is_publish: bool,
    pub current_author: UserId,
    pub override_requested: bool,
    pub now_ms: u64,
    pub lock_window_ms: u64,
}

pub fn resolve(input: &ResolveInput<'_>) -> Resolution {
    let Some(existing) = input.existing else {
        return Resolution::Accepted;
    };

    if existing.author_id == input.current_author {
        return Resolution::Accepted;
    }

    // Already seen by the session: the submitter decided with it in view.
    if existing.modified_at <= input.client_cursor {
        return Resolution::Accepted;
    }

    let blocked = if input.is_publish {
        existing.value_digest != input.candidate_digest
    } else {
        existing.is_draft() && !existing.is_expired(input.now_ms, input.lock_window_ms)
    };

    match (blocked, input.override_requested, input.is_publish) {
        (false, _, _) => Resolution::Accepted,
        (true, true, _) => Resolution::Overridden,
        (true, false, true) => Resolution::Conflict,
        (true, false, false) => Resolution::Rejected,
    }
}
