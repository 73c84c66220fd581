use std::{collections::HashMap, fmt, sync::Mutex};

use crate::{driver::ConnectionId, sync::lock};

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Id(i32),
    Name(String),
}

impl Target {
    /// Name the target is looked up under in directories.
    pub fn key(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Name(name) => name.clone(),
        }
    }
}

impl From<i32> for Target {
    fn from(value: i32) -> Self {
        Self::Id(value)
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    /// What the record is kept under. Ids and names never share a record.
    pub target: Target,
    pub name: String,
    /// `None` until the name has been resolved.
    pub id: Option<i32>,
    pub link: Option<ConnectionId>,
    /// Only locations published for this host are used.
    pub host: Option<String>,
}

impl TargetRecord {
    fn new(target: Target) -> Self {
        let id = match target {
            Target::Id(id) => Some(id),
            Target::Name(_) => None,
        };
        Self {
            name: target.key(),
            target,
            id,
            link: None,
            host: None,
        }
    }
}

#[derive(Debug, Default)]
struct Targets {
    records: HashMap<Target, TargetRecord>,
    aliases: HashMap<String, String>,
}

impl Targets {
    fn canonical(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Aliases only apply to names.
    fn canonical_target(&self, target: &Target) -> Target {
        match target {
            Target::Id(id) => Target::Id(*id),
            Target::Name(name) => Target::Name(self.canonical(name)),
        }
    }

    fn record(&mut self, target: Target) -> &mut TargetRecord {
        self.records
            .entry(target.clone())
            .or_insert_with(|| TargetRecord::new(target))
    }
}

/// Resolved ids and owning links of the targets this process sends to.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    inner: Mutex<Targets>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name a target is recorded under once aliases are applied.
    pub fn canonical(&self, target: &Target) -> String {
        lock(&self.inner).canonical_target(target).key()
    }

    /// Returns the record of `target`, creating it on first use. Numeric
    /// targets need no resolution.
    pub fn ensure(&self, target: &Target) -> TargetRecord {
        let mut inner = lock(&self.inner);
        let target = inner.canonical_target(target);
        inner.record(target).clone()
    }

    /// Record of the name `name`.
    pub fn lookup(&self, name: &str) -> Option<TargetRecord> {
        let inner = lock(&self.inner);
        inner.records.get(&Target::Name(inner.canonical(name))).cloned()
    }

    /// Records the outcome of a resolution.
    pub fn resolved(&self, name: &str, id: i32, link: ConnectionId) {
        let mut inner = lock(&self.inner);
        let target = Target::Name(inner.canonical(name));
        let record = inner.record(target);
        record.id = Some(id);
        record.link = Some(link);
    }

    /// Remembers the link `target` was last reached over.
    pub fn linked(&self, target: &Target, link: ConnectionId) {
        let mut inner = lock(&self.inner);
        let target = inner.canonical_target(target);
        inner.record(target).link = Some(link);
    }

    /// Makes `link` the owner of `name`, forgetting any earlier resolution.
    pub fn bind(&self, name: &str, link: ConnectionId) {
        let mut inner = lock(&self.inner);
        let target = Target::Name(inner.canonical(name));
        let mut record = TargetRecord::new(target.clone());
        record.link = Some(link);
        inner.records.insert(target, record);
    }

    /// Detaches `target` from its link so the next send looks it up again.
    pub fn detach(&self, target: &Target) {
        let mut inner = lock(&self.inner);
        let target = inner.canonical_target(target);
        if let Some(record) = inner.records.get_mut(&target) {
            record.link = None;
        }
    }

    pub fn alias(&self, alias: &str, name: &str) {
        let mut inner = lock(&self.inner);
        let name = inner.canonical(name);
        inner.aliases.insert(alias.to_string(), name);
    }

    pub fn restrict(&self, name: &str, host: Option<&str>) {
        let mut inner = lock(&self.inner);
        let target = Target::Name(inner.canonical(name));
        let record = inner.record(target);
        record.host = host.map(str::to_string);
        record.link = None;
    }

    /// Removes the record of `name` and every alias pointing at it.
    pub fn forget(&self, name: &str) -> bool {
        let mut inner = lock(&self.inner);
        let name = inner.canonical(name);
        inner.aliases.retain(|alias, target| alias != &name && target != &name);
        inner.records.remove(&Target::Name(name)).is_some()
    }

    /// Removes the records owned by a torn down link and returns their names.
    pub fn unlink(&self, link: ConnectionId) -> Vec<String> {
        let mut inner = lock(&self.inner);
        let owned: Vec<Target> = inner
            .records
            .values()
            .filter(|r| r.link == Some(link))
            .map(|r| r.target.clone())
            .collect();
        owned
            .iter()
            .filter_map(|target| inner.records.remove(target))
            .map(|record| record.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
