use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-pass record of which filenames the destination holds, by subfolder.
///
/// Transfers complete concurrently, so every access goes through the mutex.
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct ExistingIndex {
    folders: Mutex<HashMap<String, HashSet<String>>>,
}

impl ExistingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S, F>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, F)>,
        S: Into<String>,
        F: Into<String>,
    {
        let index = Self::new();
        {
            let mut folders = index.lock();
            for (subfolder, filename) in entries {
                folders
                    .entry(subfolder.into())
                    .or_default()
                    .insert(filename.into());
            }
        }
        index
    }

    /// Replaces everything known about `subfolder` with a fresh listing.
    pub fn replace_folder(&self, subfolder: &str, files: HashSet<String>) {
        self.lock().insert(subfolder.to_string(), files);
    }

    pub fn contains(&self, subfolder: &str, filename: &str) -> bool {
        self.lock()
            .get(subfolder)
            .is_some_and(|files| files.contains(filename))
    }

    /// Returns `true` when the filename was not yet recorded.
    pub fn insert(&self, subfolder: &str, filename: &str) -> bool {
        self.lock()
            .entry(subfolder.to_string())
            .or_default()
            .insert(filename.to_string())
    }

    pub fn remove(&self, subfolder: &str, filename: &str) -> bool {
        self.lock()
            .get_mut(subfolder)
            .is_some_and(|files| files.remove(filename))
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the index, for logging and assertions.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.lock()
            .iter()
            .map(|(subfolder, files)| (subfolder.clone(), files.iter().cloned().collect()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_then_contains() {
        let index = ExistingIndex::new();
        assert!(!index.contains("2024-01-01", "a.pdf"));
        assert!(index.insert("2024-01-01", "a.pdf"));
        assert!(!index.insert("2024-01-01", "a.pdf"));
        assert!(index.contains("2024-01-01", "a.pdf"));
        assert!(!index.contains("2024-01-02", "a.pdf"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn replace_folder_drops_previous_entries() {
        let index = ExistingIndex::from_entries([("2024-01-01", "a.pdf"), ("2024-01-02", "b.pdf")]);
        index.replace_folder("2024-01-01", HashSet::from(["c.pdf".to_string()]));

        assert!(!index.contains("2024-01-01", "a.pdf"));
        assert!(index.contains("2024-01-01", "c.pdf"));
        assert!(index.contains("2024-01-02", "b.pdf"));
    }

    #[test]
    fn empty_listing_is_recorded_as_empty_folder() {
        let index = ExistingIndex::new();
        index.replace_folder("2024-01-01", HashSet::new());
        assert!(index.is_empty());
        assert_eq!(index.snapshot().get("2024-01-01"), Some(&BTreeSet::new()));
    }

    #[test]
    fn remove_forgets_filename() {
        let index = ExistingIndex::from_entries([("d", "a.pdf")]);
        assert!(index.remove("d", "a.pdf"));
        assert!(!index.remove("d", "a.pdf"));
        assert!(!index.contains("d", "a.pdf"));
    }

    #[test]
    fn concurrent_inserts_are_all_kept() {
        let index = Arc::new(ExistingIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for n in 0..50 {
                        index.insert("shared", &format!("{worker}-{n}.pdf"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), 400);
    }
}
