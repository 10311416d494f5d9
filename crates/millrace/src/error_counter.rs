//! Consecutive handler-failure accounting.
//!
//! Counts are keyed by `(process name, run id)` so a flaky run trips the
//! pause threshold for its own processor without affecting sibling runs or
//! shards. Any successful handler invocation clears the count.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct ErrorCounter {
    counts: Mutex<HashMap<(String, String), u32>>,
}

impl ErrorCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the new consecutive count.
    pub(crate) fn add(&self, process_name: &str, run_id: &str) -> u32 {
        let mut counts = self.counts.lock().expect("error counter lock poisoned");
        let count = counts
            .entry((process_name.to_owned(), run_id.to_owned()))
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the count after a success or a pause trip.
    pub(crate) fn clear(&self, process_name: &str, run_id: &str) {
        let mut counts = self.counts.lock().expect("error counter lock poisoned");
        counts.remove(&(process_name.to_owned(), run_id.to_owned()));
    }
}
