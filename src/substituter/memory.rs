// src/substituter/memory.rs

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{Substituter, SubstituterError, SubstituterResult};
use crate::store::Store;
use crate::types::{DrvOutput, PathInfo, StorePath, UnkeyedRealisation};

/// A substituter serving objects from memory.
#[derive(Debug)]
pub struct MemorySubstituter {
    uri: String,
    trusted: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    paths: BTreeMap<StorePath, PathInfo>,
    realisations: BTreeMap<DrvOutput, UnkeyedRealisation>,
}

impl MemorySubstituter {
    pub fn new(uri: impl Into<String>) -> Self {
        MemorySubstituter {
            uri: uri.into(),
            trusted: false,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_path(&self, info: PathInfo) {
        self.inner().paths.insert(info.path.clone(), info);
    }

    pub fn add_realisation(&self, id: DrvOutput, value: UnkeyedRealisation) {
        self.inner().realisations.insert(id, value);
    }

    pub fn remove_path(&self, path: &StorePath) {
        self.inner().paths.remove(path);
    }
}

impl Substituter for MemorySubstituter {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn query_path_info(&self, path: &StorePath) -> SubstituterResult<Option<PathInfo>> {
        Ok(self.inner().paths.get(path).cloned())
    }

    fn query_realisation(&self, id: &DrvOutput) -> SubstituterResult<Option<UnkeyedRealisation>> {
        Ok(self.inner().realisations.get(id).cloned())
    }

    fn copy_path(&self, info: &PathInfo, dest: &dyn Store) -> SubstituterResult<()> {
        if !self.inner().paths.contains_key(&info.path) {
            return Err(SubstituterError::Gone(info.path.clone()));
        }
        dest.register_valid_path(info.clone())
            .map_err(|e| SubstituterError::Rejected {
                path: info.path.clone(),
                reason: e.to_string(),
            })
    }
}
