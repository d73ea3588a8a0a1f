//! Pending expectations for attachment records this process created
//!
//! After creating a record the controller may reconcile another pod with
//! the same key before the new record shows up in a list. Without a marker
//! it would create a second record and a second Mountpoint Pod. A key is
//! marked pending when its record is created and cleared once a list
//! returns that record.
//!
//! Entries have no expiry: a record deleted before it was ever listed keeps
//! its key pending until the process restarts.

use dashmap::DashSet;

use crate::key::AttachmentKey;

/// In-process set of keys whose record creation is not yet observed
#[derive(Debug, Default)]
pub struct PendingExpectations {
    pending: DashSet<String>,
}

impl PendingExpectations {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a record for `key` as created but not yet observed
    pub fn set_pending(&self, key: &AttachmentKey) {
        self.pending.insert(key.expectation_key());
    }

    /// Whether a record for `key` was created but not yet observed
    pub fn is_pending(&self, key: &AttachmentKey) -> bool {
        self.pending.contains(&key.expectation_key())
    }

    /// Forget the marker for `key`. Returns true if one was set.
    pub fn clear(&self, key: &AttachmentKey) -> bool {
        self.pending.remove(&key.expectation_key()).is_some()
    }

    /// Number of keys currently pending
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
