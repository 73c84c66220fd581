use std::sync::Mutex;

use crate::sync::lock;

use super::{Directory, DirectoryError, Entry, matching};

/// Directory whose entries live only in memory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: Mutex<Vec<Entry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, entry: Entry) -> Self {
        lock(&self.entries).push(entry);
        self
    }
}

impl Directory for StaticDirectory {
    fn name(&self) -> &str {
        "static"
    }

    fn retrieve(
        &self,
        qualifier: &str,
        target: &str,
        host: Option<&str>,
    ) -> Result<Option<Vec<String>>, DirectoryError> {
        Ok(matching(&lock(&self.entries), qualifier, target, host))
    }

    fn add(&self, entry: Entry) -> Result<(), DirectoryError> {
        let mut entries = lock(&self.entries);
        if !entries.contains(&entry) {
            entries.push(entry);
        }
        Ok(())
    }

    fn delete(
        &self,
        qualifier: &str,
        target: &str,
        url: Option<&str>,
    ) -> Result<(), DirectoryError> {
        lock(&self.entries).retain(|e| {
            e.qualifier != qualifier || e.target != target || url.is_some_and(|u| e.url != u)
        });
        Ok(())
    }

    fn commit(&self) -> Result<(), DirectoryError> {
        Ok(())
    }
}
