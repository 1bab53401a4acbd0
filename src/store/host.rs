//! Hosts, test names and the alias index
//!
//! Every host has one canonical identity ([`HostId`]). Configured display
//! names and aliases all resolve to that id through a single index; log
//! records belong to the canonical host only.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::color::Color;
use crate::config::HostConfig;
use crate::error::{BoardError, BoardResult};

use super::record::LogRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestId(u32);

impl TestId {
    pub fn from_raw(raw: u32) -> Self {
        TestId(raw)
    }
}

/// Interned test names, shared by all hosts
#[derive(Debug, Default)]
pub struct TestRegistry {
    names: Vec<String>,
    index: HashMap<String, TestId>,
}

impl TestRegistry {
    pub fn intern(&mut self, name: &str) -> TestId {
        if let Some(id) = self.index.get(name) {
            return *id;
        }
        let id = TestId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TestId> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: TestId) -> &str {
        self.names
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }
}

/// Descriptive data of a host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMeta {
    pub name: String,
    pub ip: Option<IpAddr>,
    pub pages: Vec<String>,
    pub groups: Vec<String>,
    pub class: Option<String>,
    pub display_group: Option<String>,
    /// Present in the configured host list (as opposed to created by a report)
    pub configured: bool,
}

impl HostMeta {
    pub fn unconfigured(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            name: config.name.clone(),
            ip: config.ip,
            pages: config.pages.clone(),
            groups: config.groups.clone(),
            class: config.class.clone(),
            display_group: config.display_group.clone(),
            configured: true,
        }
    }

    pub fn page_path(&self) -> String {
        self.pages.join(",")
    }

    pub fn ip_string(&self) -> String {
        self.ip.map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub test: TestId,
    pub origin: String,
}

#[derive(Debug)]
pub struct Host {
    pub id: HostId,
    pub meta: HostMeta,
    pub records: BTreeMap<RecordKey, LogRecord>,
}

impl Host {
    /// Worst color among the host's records, `None` without records.
    pub fn color(&self) -> Option<Color> {
        self.records.values().map(|r| r.color).max()
    }

    /// Key of the first record for a test, whatever its origin.
    pub fn find_key(&self, test: TestId) -> Option<RecordKey> {
        self.records.keys().find(|k| k.test == test).cloned()
    }

    pub fn find(&self, test: TestId) -> Option<&LogRecord> {
        self.records.values().find(|r| r.test == test)
    }

    pub fn keys_for(&self, test: TestId) -> Vec<RecordKey> {
        self.records.keys().filter(|k| k.test == test).cloned().collect()
    }
}

/// Owner of all hosts plus the name/alias → id index
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: BTreeMap<HostId, Host>,
    names: HashMap<String, HostId>,
    next: u32,
}

fn index_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl HostRegistry {
    pub fn resolve(&self, name: &str) -> Option<HostId> {
        self.names.get(&index_key(name)).copied()
    }

    pub fn get(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    pub fn get_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.hosts.get_mut(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Host> {
        self.resolve(name).and_then(|id| self.hosts.get(&id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Insert a host, or refresh the metadata of an existing one with the
    /// same canonical name. Aliases are added to the index.
    pub fn upsert(&mut self, meta: HostMeta, aliases: &[String]) -> HostId {
        let id = match self.resolve(&meta.name) {
            Some(id) => {
                if let Some(host) = self.hosts.get_mut(&id) {
                    host.meta = meta;
                }
                id
            }
            None => {
                let id = HostId(self.next);
                self.next += 1;
                self.names.insert(index_key(&meta.name), id);
                self.hosts.insert(
                    id,
                    Host {
                        id,
                        meta,
                        records: BTreeMap::new(),
                    },
                );
                id
            }
        };
        for alias in aliases {
            self.names.entry(index_key(alias)).or_insert(id);
        }
        id
    }

    /// Remove a host together with every name pointing at it.
    pub fn remove(&mut self, id: HostId) -> Option<Host> {
        self.names.retain(|_, target| *target != id);
        self.hosts.remove(&id)
    }

    /// Give a host a new canonical name. Aliases keep pointing at it.
    pub fn rename(&mut self, id: HostId, new_name: &str) -> BoardResult<()> {
        if self.resolve(new_name).is_some() {
            return Err(BoardError::Protocol(format!(
                "cannot rename to '{new_name}': host exists"
            )));
        }
        let host = self
            .hosts
            .get_mut(&id)
            .ok_or_else(|| BoardError::NotFound(format!("host #{}", id.0)))?;
        self.names.remove(&index_key(&host.meta.name));
        host.meta.name = new_name.to_string();
        self.names.insert(index_key(new_name), id);
        Ok(())
    }
}
