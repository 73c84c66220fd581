//! Name services mapping targets to candidate URLs.
//!
//! A [`Directory`] answers `(qualifier, target[, host])` with the URLs a
//! target can be reached on. Directories are queried in declared order by a
//! [`DirectoryChain`], which caches answers until a failed resolution evicts
//! them.
//!
//! # See Also
//!
//! - [`memory`]: entries configured in code.
//! - [`file`]: entries kept in a plain text file.
pub mod file;
pub mod memory;

use std::{
    collections::HashMap,
    fmt, io,
    sync::{Arc, Mutex},
};

use log::{debug, warn};
use thiserror::Error;

use crate::sync::lock;

pub use file::FileDirectory;
pub use memory::StaticDirectory;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no directory knows '{target}' (qualifier '{qualifier}')")]
    NoEntry { qualifier: String, target: String },
    #[error("malformed directory line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("directory I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One published location of a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub qualifier: String,
    pub target: String,
    pub url: String,
    /// Host the target runs on, when published with one.
    pub host: Option<String>,
}

impl Entry {
    pub fn new(qualifier: &str, target: &str, url: &str) -> Self {
        Self {
            qualifier: qualifier.to_string(),
            target: target.to_string(),
            url: url.to_string(),
            host: None,
        }
    }

    pub fn on_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    fn matches(&self, qualifier: &str, target: &str, host: Option<&str>) -> bool {
        self.qualifier == qualifier
            && self.target == target
            && host.is_none_or(|h| self.host.as_deref() == Some(h))
    }
}

/// URLs of the entries answering a query, in publication order.
pub(crate) fn matching(
    entries: &[Entry],
    qualifier: &str,
    target: &str,
    host: Option<&str>,
) -> Option<Vec<String>> {
    let urls: Vec<String> = entries
        .iter()
        .filter(|e| e.matches(qualifier, target, host))
        .map(|e| e.url.clone())
        .collect();
    (!urls.is_empty()).then_some(urls)
}

pub trait Directory: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate URLs for `target`, or `None` when this directory has no
    /// opinion. A `host` restricts the answer to entries published for it.
    fn retrieve(
        &self,
        qualifier: &str,
        target: &str,
        host: Option<&str>,
    ) -> Result<Option<Vec<String>>, DirectoryError>;

    fn add(&self, entry: Entry) -> Result<(), DirectoryError>;

    /// Removes the entries of `target`, or only the one at `url`.
    fn delete(
        &self,
        qualifier: &str,
        target: &str,
        url: Option<&str>,
    ) -> Result<(), DirectoryError>;

    /// Persists pending changes.
    fn commit(&self) -> Result<(), DirectoryError>;

    fn shutdown(&self) {}
}

type CacheKey = (String, String, Option<String>);

/// Ordered directories with a shared answer cache.
#[derive(Default)]
pub struct DirectoryChain {
    directories: Vec<Arc<dyn Directory>>,
    cache: Mutex<HashMap<CacheKey, Vec<String>>>,
}

impl DirectoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directories.push(directory);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }

    /// Asks each directory in turn until one answers. Directory failures are
    /// logged and the next one is tried.
    pub fn lookup(
        &self,
        qualifier: &str,
        target: &str,
        host: Option<&str>,
    ) -> Result<Vec<String>, DirectoryError> {
        let key = (
            qualifier.to_string(),
            target.to_string(),
            host.map(str::to_string),
        );
        if let Some(urls) = lock(&self.cache).get(&key) {
            return Ok(urls.clone());
        }

        for directory in &self.directories {
            match directory.retrieve(qualifier, target, host) {
                Ok(Some(urls)) if !urls.is_empty() => {
                    debug!("{} resolved '{target}' to {urls:?}", directory.name());
                    lock(&self.cache).insert(key, urls.clone());
                    return Ok(urls);
                }
                Ok(_) => {}
                Err(e) => warn!("{} failed to look up '{target}': {e}", directory.name()),
            }
        }
        Err(DirectoryError::NoEntry {
            qualifier: qualifier.to_string(),
            target: target.to_string(),
        })
    }

    /// Drops every cached answer for `target`.
    pub fn evict(&self, qualifier: &str, target: &str) {
        lock(&self.cache).retain(|(q, t, _), _| q != qualifier || t != target);
    }

    /// Publishes `entry` in the first directory and commits it.
    pub fn publish(&self, entry: Entry) -> Result<(), DirectoryError> {
        let Some(directory) = self.directories.first() else {
            return Ok(());
        };
        self.evict(&entry.qualifier, &entry.target);
        directory.add(entry)?;
        directory.commit()
    }

    /// Withdraws a published location from the first directory.
    pub fn withdraw(&self, qualifier: &str, target: &str, url: &str) -> Result<(), DirectoryError> {
        let Some(directory) = self.directories.first() else {
            return Ok(());
        };
        self.evict(qualifier, target);
        directory.delete(qualifier, target, Some(url))?;
        directory.commit()
    }

    pub fn shutdown(&self) {
        for directory in &self.directories {
            directory.shutdown();
        }
        lock(&self.cache).clear();
    }
}

impl fmt::Debug for DirectoryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.directories.iter().map(|d| d.name()))
            .finish()
    }
}
