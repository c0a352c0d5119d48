//! Name → map root table, stored in the reserved catalog record

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{EmberError, Result};
use crate::store::{Recid, CATALOG_RECID};

use super::{decode, encode, SharedEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapKind {
    Hash,
    Tree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    kind: MapKind,
    root: Recid,
}

pub struct Catalog {
    engine: SharedEngine,
    /// Serializes read-modify-write of the catalog record
    lock: Mutex<()>,
}

impl Catalog {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, CatalogEntry>> {
        let bytes = self.engine.get(CATALOG_RECID)?;
        if bytes.is_empty() {
            return Ok(BTreeMap::new());
        }
        decode(&bytes)
    }

    /// Root of map `name`, created with `create` if absent
    pub fn open_or_create(
        &self,
        name: &str,
        kind: MapKind,
        create: impl FnOnce() -> Result<Recid>,
    ) -> Result<Recid> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;

        if let Some(entry) = entries.get(name) {
            if entry.kind != kind {
                return Err(EmberError::Storage(format!(
                    "map '{}' exists as {:?}, requested {:?}",
                    name, entry.kind, kind
                )));
            }
            return Ok(entry.root);
        }

        let root = create()?;
        entries.insert(name.to_string(), CatalogEntry { kind, root });
        self.engine.update(CATALOG_RECID, &encode(&entries)?)?;
        tracing::debug!(name, ?kind, root, "Map created");
        Ok(root)
    }

    /// Named maps in name order
    pub fn list(&self) -> Result<Vec<(String, MapKind)>> {
        let _guard = self.lock.lock();
        Ok(self
            .load()?
            .into_iter()
            .map(|(name, entry)| (name, entry.kind))
            .collect())
    }
}
