//! Best-effort notifications emitted while the core works.
//!
//! Handlers implement [`EventSink`] and are installed process-wide with
//! [`set_sink`]. Every method has a default implementation that logs through
//! `tracing`, so a sink only overrides the notifications it cares about.
//! Notifications must not block; the core calls them inline.

use crate::entity::Entity;
use once_cell::sync::Lazy;
use std::{
    path::Path,
    sync::{Arc, RwLock},
};

/// Receiver for the core's notifications.
pub trait EventSink: Send + Sync {
    /// The persistent value file looks corrupt or was written by a different
    /// format version. The store is treated as empty and rebuilt.
    fn data_file_out_of_sync(&self, path: &Path) {
        warn!(path = %path.display(), "value file is out of sync, rebuilding it");
    }

    /// A cycle was detected while resolving dependency values.
    fn dep_value_cyclic(&self, entity: &Entity) {
        warn!(%entity, "cyclic dependency value");
    }

    /// A value was referenced that no node produces.
    fn unknown_value(&self, entity: &Entity) {
        warn!(%entity, "unknown value");
    }

    /// A node was determined stale and needs to be rebuilt.
    fn outdated_node(&self, description: &str) {
        info!(node = description, "outdated node");
    }

    /// Two distinct nodes claim the same target. Reported, not resolved.
    fn target_built_twice(&self, entity: &Entity, node_a: &str, node_b: &str) {
        warn!(%entity, node_a, node_b, "target is built by different nodes");
    }
}

/// The default sink: every notification goes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {}

static SINK: Lazy<RwLock<Arc<dyn EventSink>>> =
    Lazy::new(|| RwLock::new(Arc::new(LogEventSink)));

/// Installs the process-wide event sink.
pub fn set_sink(sink: Arc<dyn EventSink>) {
    *SINK.write().unwrap_or_else(|err| err.into_inner()) = sink;
}

/// The currently installed event sink.
pub fn sink() -> Arc<dyn EventSink> {
    SINK.read().unwrap_or_else(|err| err.into_inner()).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        outdated: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn outdated_node(&self, _description: &str) {
            self.outdated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn installed_sink_receives_events() {
        let counting = Arc::new(CountingSink::default());
        set_sink(counting.clone());
        sink().outdated_node("cc << a.c >> a.o");
        assert_eq!(counting.outdated.load(Ordering::SeqCst), 1);
        set_sink(Arc::new(LogEventSink));
    }
}
