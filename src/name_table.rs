//! The Name Table: the names under the authoritative suffix and the
//! IPv4 address each one resolves to.
//!
//! A `NameTable` is an immutable snapshot.  The live table is a
//! `SharedNameTable`, which readers `load` without locking and
//! writers replace whole, so a query never sees a half-applied
//! update.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::read_to_string;

use crate::hosts::{self, Hosts};
use crate::metrics;
use crate::protocol::types::DomainName;
use crate::settings::StaticRecord;

/// One snapshot of the table.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NameTable {
    entries: HashMap<DomainName, Ipv4Addr>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &DomainName) -> Option<Ipv4Addr> {
        self.entries.get(name).copied()
    }

    /// Whether some entry is strictly below `name`: an empty
    /// non-terminal, if `name` itself has no entry.
    pub fn has_descendant(&self, name: &DomainName) -> bool {
        self.entries
            .keys()
            .any(|entry| entry != name && entry.is_subdomain_of(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DomainName, &Ipv4Addr)> {
        self.entries.iter()
    }
}

impl FromIterator<(DomainName, Ipv4Addr)> for NameTable {
    fn from_iter<I: IntoIterator<Item = (DomainName, Ipv4Addr)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<Hosts> for NameTable {
    fn from(hosts: Hosts) -> Self {
        Self { entries: hosts.v4 }
    }
}

/// The live table, shared between the listener's tasks and whatever
/// registers names.
#[derive(Debug, Default)]
pub struct SharedNameTable {
    current: ArcSwap<NameTable>,
}

impl SharedNameTable {
    pub fn new(table: NameTable) -> Self {
        metrics::NAME_TABLE_ENTRIES.set(gauge_value(table.len()));
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// The current snapshot.  Holding on to it does not block
    /// writers: they publish a new snapshot alongside.
    pub fn load(&self) -> Arc<NameTable> {
        self.current.load_full()
    }

    /// Replace the whole table.
    pub fn publish(&self, table: NameTable) {
        let len = table.len();
        self.current.store(Arc::new(table));
        metrics::NAME_TABLE_ENTRIES.set(gauge_value(len));
        tracing::debug!(entries = %len, "published name table");
    }

    /// Add or update a single name, returning its previous address.
    pub fn insert(&self, name: DomainName, address: Ipv4Addr) -> Option<Ipv4Addr> {
        let previous = self.current.rcu(|table| {
            let mut next = NameTable::clone(table);
            next.entries.insert(name.clone(), address);
            next
        });
        metrics::NAME_TABLE_ENTRIES.set(gauge_value(self.current.load().len()));
        previous.get(&name)
    }

    /// Remove a single name, returning its previous address.
    pub fn remove(&self, name: &DomainName) -> Option<Ipv4Addr> {
        let previous = self.current.rcu(|table| {
            if table.entries.contains_key(name) {
                let mut next = NameTable::clone(table);
                next.entries.remove(name);
                Arc::new(next)
            } else {
                Arc::clone(table)
            }
        });
        metrics::NAME_TABLE_ENTRIES.set(gauge_value(self.current.load().len()));
        previous.get(name)
    }
}

impl SharedNameTable {
    /// Rebuild the table from its sources with `load` and publish
    /// the result, returning the new number of entries.  Both
    /// outcomes are counted in `name_table_reloads_total`.
    ///
    /// # Errors
    ///
    /// If `load` fails.  The current table stays in place.
    pub async fn reload(
        &self,
        suffix: &DomainName,
        records: &[StaticRecord],
        hosts_files: &[PathBuf],
    ) -> Result<usize, LoadError> {
        match load(suffix, records, hosts_files).await {
            Ok(table) => {
                let len = table.len();
                tracing::info!(entries = %len, "reloaded name table");
                self.publish(table);
                metrics::NAME_TABLE_RELOADS_TOTAL
                    .with_label_values(&[metrics::RELOAD_OK])
                    .inc();
                Ok(len)
            }
            Err(error) => {
                tracing::warn!(?error, "could not reload name table, keeping the old one");
                metrics::NAME_TABLE_RELOADS_TOTAL
                    .with_label_values(&[metrics::RELOAD_FAILED])
                    .inc();
                Err(error)
            }
        }
    }
}

fn gauge_value(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

/// Build a table from hosts files and statically configured records.
/// Hosts files are merged in order, then the static records are
/// applied on top.
///
/// Names outside `suffix` can never be answered, so they are logged
/// and kept out of the table.
///
/// # Errors
///
/// If any hosts file cannot be read or parsed.  Nothing is returned
/// in that case, so a reload never publishes a partial table.
pub async fn load(
    suffix: &DomainName,
    records: &[StaticRecord],
    hosts_files: &[PathBuf],
) -> Result<NameTable, LoadError> {
    let mut combined = Hosts::new();
    for path in hosts_files {
        combined.merge(hosts_from_file(path).await?);
    }
    for record in records {
        combined.v4.insert(record.name.clone(), record.a);
    }

    combined.v4.retain(|name, _| {
        let inside = name.is_subdomain_of(suffix);
        if !inside {
            tracing::warn!(%name, %suffix, "ignoring name outside the authoritative suffix");
        }
        inside
    });

    Ok(combined.into())
}

/// Read a hosts file, for example /etc/hosts.
async fn hosts_from_file(path: &Path) -> Result<Hosts, LoadError> {
    let data = read_to_string(path).await.map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Hosts::deserialise(&data).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not read hosts file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse hosts file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: hosts::Error,
    },
}
