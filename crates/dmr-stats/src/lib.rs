//! In-process operational counters (spec.md §3 component I), exposed as a
//! name -> number map. Each counter is an independent atomic; `snapshot`
//! gives a point-in-time read, never a consistent multi-counter view.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

macro_rules! counters {
    ($($field:ident => $name:literal),+ $(,)?) => {
        #[derive(Default)]
        pub struct Stats {
            $($field: AtomicI64,)+
        }

        impl Stats {
            /// Read every counter into a name -> value map.
            pub fn snapshot(&self) -> BTreeMap<&'static str, i64> {
                let mut out = BTreeMap::new();
                $(out.insert($name, self.$field.load(Ordering::Relaxed));)+
                out
            }
        }
    };
}

counters! {
    tasks_claimed => "tasks.claimed",
    tasks_completed => "tasks.completed",
    tasks_retried => "tasks.retried",
    tasks_dead_lettered => "tasks.dead_lettered",
    entities_refreshed => "entities.refreshed",
    entities_unchanged => "entities.unchanged",
    reports_updated => "reports.updated",
    messages_processed => "messages.processed",
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_claimed(&self) {
        self.tasks_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_dead_lettered(&self) {
        self.tasks_dead_lettered.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(total = self.tasks_dead_lettered.load(Ordering::Relaxed), "tasks.dead_lettered incremented");
    }

    pub fn record_entity_refreshed(&self, changed: bool) {
        if changed {
            self.entities_refreshed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entities_unchanged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_report_updated(&self) {
        self.reports_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let stats = Stats::new();
        stats.record_task_claimed();
        stats.record_task_claimed();
        stats.record_task_dead_lettered();

        let snap = stats.snapshot();
        assert_eq!(snap["tasks.claimed"], 2);
        assert_eq!(snap["tasks.dead_lettered"], 1);
        assert_eq!(snap["tasks.completed"], 0);
    }

    #[test]
    fn entity_refresh_splits_changed_vs_unchanged() {
        let stats = Stats::new();
        stats.record_entity_refreshed(true);
        stats.record_entity_refreshed(false);
        stats.record_entity_refreshed(false);

        let snap = stats.snapshot();
        assert_eq!(snap["entities.refreshed"], 1);
        assert_eq!(snap["entities.unchanged"], 2);
    }
}
