//! Tracks which sources currently have a flush in progress.
//!
//! Sibling code paths ask "is any flush ongoing right now" in O(1) before
//! they touch the pipeline; the per-source async flag distinguishes flushes
//! whose completion arrives later on the bus.

use std::collections::HashMap;

use parking_lot::Mutex;

use rialto_core::types::MediaSourceType;

/// One entry per source with an active flush.
#[derive(Debug, Default)]
pub struct FlushWatcher {
    flushing: Mutex<HashMap<MediaSourceType, bool>>,
}

impl FlushWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a flush in progress for `source_type`. Unknown sources are
    /// not tracked.
    pub fn set_flushing(&self, source_type: MediaSourceType, async_flush: bool) {
        if source_type != MediaSourceType::Unknown {
            self.flushing.lock().insert(source_type, async_flush);
        }
    }

    /// Clears the flush flag for `source_type`.
    pub fn set_flushed(&self, source_type: MediaSourceType) {
        self.flushing.lock().remove(&source_type);
    }

    /// True while any source is flushing.
    #[must_use]
    pub fn is_flush_ongoing(&self) -> bool {
        !self.flushing.lock().is_empty()
    }

    /// True while any source is flushing asynchronously.
    #[must_use]
    pub fn is_async_flush_ongoing(&self) -> bool {
        self.flushing.lock().values().any(|async_flush| *async_flush)
    }

    /// True while this particular source is flushing.
    #[must_use]
    pub fn is_flushing(&self, source_type: MediaSourceType) -> bool {
        self.flushing.lock().contains_key(&source_type)
    }

    /// The sources currently flushing, with their async flag.
    #[must_use]
    pub fn flushing_sources(&self) -> Vec<(MediaSourceType, bool)> {
        self.flushing
            .lock()
            .iter()
            .map(|(source_type, async_flush)| (*source_type, *async_flush))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_flush_state_per_source() {
        let watcher = FlushWatcher::new();

        // Not flushing after startup.
        assert!(!watcher.is_flush_ongoing());

        // Flushing once set for at least one source.
        watcher.set_flushing(MediaSourceType::Audio, false);
        assert!(watcher.is_flush_ongoing());
        assert!(!watcher.is_async_flush_ongoing());

        watcher.set_flushing(MediaSourceType::Video, true);
        assert!(watcher.is_flush_ongoing());
        assert!(watcher.is_async_flush_ongoing());

        // Still flushing until all flags are cleared.
        watcher.set_flushed(MediaSourceType::Audio);
        assert!(watcher.is_flush_ongoing());
        assert!(watcher.is_async_flush_ongoing());

        watcher.set_flushed(MediaSourceType::Video);
        assert!(!watcher.is_flush_ongoing());
        assert!(!watcher.is_async_flush_ongoing());
    }

    #[test]
    fn unknown_source_type_is_not_tracked() {
        let watcher = FlushWatcher::new();
        watcher.set_flushing(MediaSourceType::Unknown, true);
        assert!(!watcher.is_flush_ongoing());
    }

    #[test]
    fn per_source_queries_are_independent() {
        let watcher = FlushWatcher::new();
        watcher.set_flushing(MediaSourceType::Audio, false);
        assert!(watcher.is_flushing(MediaSourceType::Audio));
        assert!(!watcher.is_flushing(MediaSourceType::Video));
    }
}
