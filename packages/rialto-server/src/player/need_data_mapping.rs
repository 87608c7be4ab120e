//! Dedupe set for outstanding need-data notifications.
//!
//! The pipeline may ask the same appsrc for data any number of times while
//! one NeedMediaData notification is already on its way to the client; this
//! set collapses the duplicates so at most one request per source is in
//! flight per cycle.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::backend::AppSrcId;

#[derive(Debug, Default)]
pub struct NeedDataMapping {
    scheduled: Mutex<HashSet<AppSrcId>>,
}

impl NeedDataMapping {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a need-data notification for this appsrc is outstanding.
    #[must_use]
    pub fn is_scheduled(&self, appsrc: AppSrcId) -> bool {
        self.scheduled.lock().contains(&appsrc)
    }

    /// Records an outstanding notification.
    pub fn set_scheduled(&self, appsrc: AppSrcId) {
        self.scheduled.lock().insert(appsrc);
    }

    /// Clears the outstanding notification (HaveData arrived, or the
    /// source was flushed or removed).
    pub fn clear_scheduled(&self, appsrc: AppSrcId) {
        self.scheduled.lock().remove(&appsrc);
    }

    /// Snapshot of the appsrcs with an outstanding notification.
    #[must_use]
    pub fn scheduled(&self) -> Vec<AppSrcId> {
        self.scheduled.lock().iter().copied().collect()
    }
}
