//! Ordered record of calls made into fakes

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // A panicking fake must not hide the calls it saw.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Entries starting with `prefix`
    pub fn filtered(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl std::fmt::Display for CallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in self.lock().iter() {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}
