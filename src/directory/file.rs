//! Line-oriented directory file.
//!
//! Each non-blank line not starting with `#` publishes one location:
//!
//! ```text
//! # qualifier  target  url                     [host]
//! -            echo    tcp://127.0.0.1:7000
//! prod         billing tcp://10.1.0.4:7000     db-host-1
//! ```
//!
//! A qualifier of `-` stands for the empty qualifier. Changes made through
//! [`Directory::add`] and [`Directory::delete`] are kept in memory until
//! [`Directory::commit`] rewrites the file.
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, info};

use crate::sync::lock;

use super::{Directory, DirectoryError, Entry, matching};

const EMPTY_QUALIFIER: &str = "-";

#[derive(Debug)]
struct State {
    entries: Vec<Entry>,
    dirty: bool,
}

#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    state: Mutex<State>,
}

impl FileDirectory {
    /// Loads `path`, starting empty when the file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let entries = match File::open(&path) {
            Ok(file) => parse(BufReader::new(file))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("loaded {} entries from {}", entries.len(), path.display());
        Ok(Self {
            path,
            state: Mutex::new(State {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse<R: BufRead>(reader: R) -> Result<Vec<Entry>, DirectoryError> {
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (qualifier, target, url, host) = match fields.as_slice() {
            [q, t, u] => (*q, *t, *u, None),
            [q, t, u, h] => (*q, *t, *u, Some(*h)),
            _ => {
                return Err(DirectoryError::Malformed {
                    line: i + 1,
                    reason: format!("expected 3 or 4 fields, found {}", fields.len()),
                });
            }
        };
        let qualifier = if qualifier == EMPTY_QUALIFIER {
            ""
        } else {
            qualifier
        };
        let mut entry = Entry::new(qualifier, target, url);
        entry.host = host.map(str::to_string);
        entries.push(entry);
    }
    Ok(entries)
}

fn render(entries: &[Entry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let qualifier = if entry.qualifier.is_empty() {
            EMPTY_QUALIFIER
        } else {
            &entry.qualifier
        };
        out.push_str(&format!("{qualifier} {} {}", entry.target, entry.url));
        if let Some(host) = &entry.host {
            out.push(' ');
            out.push_str(host);
        }
        out.push('\n');
    }
    out
}

impl Directory for FileDirectory {
    fn name(&self) -> &str {
        "file"
    }

    fn retrieve(
        &self,
        qualifier: &str,
        target: &str,
        host: Option<&str>,
    ) -> Result<Option<Vec<String>>, DirectoryError> {
        Ok(matching(&lock(&self.state).entries, qualifier, target, host))
    }

    fn add(&self, entry: Entry) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        if !state.entries.contains(&entry) {
            state.entries.push(entry);
            state.dirty = true;
        }
        Ok(())
    }

    fn delete(
        &self,
        qualifier: &str,
        target: &str,
        url: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        let before = state.entries.len();
        state.entries.retain(|e| {
            e.qualifier != qualifier || e.target != target || url.is_some_and(|u| e.url != u)
        });
        let changed = state.entries.len() != before;
        state.dirty |= changed;
        Ok(())
    }

    /// Writes the entries to a sibling file and renames it over the original.
    fn commit(&self) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        if !state.dirty {
            return Ok(());
        }
        let staging = self.path.with_extension("tmp");
        let mut file = File::create(&staging)?;
        file.write_all(render(&state.entries).as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;
        state.dirty = false;
        info!("committed {} entries to {}", state.entries.len(), self.path.display());
        Ok(())
    }
}
