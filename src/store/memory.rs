// src/store/memory.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::{PathLock, Store};
use crate::derivation::Derivation;
use crate::errors::{RealiserError, Result};
use crate::types::{DrvOutput, PathInfo, Realisation, StorePath};

/// A store kept entirely in memory.
///
/// Used by tests and by hosts that only need to plan a build. Registration
/// order is recorded so callers can check that references were registered
/// before their referrers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    locks: Arc<Mutex<BTreeSet<StorePath>>>,
}

#[derive(Debug, Default)]
struct Inner {
    paths: BTreeMap<StorePath, PathInfo>,
    derivations: BTreeMap<StorePath, Derivation>,
    realisations: BTreeMap<DrvOutput, Realisation>,
    corrupt: BTreeSet<StorePath>,
    registration_log: Vec<StorePath>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a valid path without checking its references.
    pub fn add_valid_path(&self, info: PathInfo) {
        let mut inner = self.inner();
        inner.corrupt.remove(&info.path);
        inner.paths.insert(info.path.clone(), info);
    }

    pub fn add_derivation(&self, drv: &Derivation) -> StorePath {
        let path = drv.store_path();
        let mut info = PathInfo::new(path.clone());
        info.references = drv
            .input_srcs
            .iter()
            .chain(drv.input_drvs.keys())
            .cloned()
            .collect();

        let mut inner = self.inner();
        inner.derivations.insert(path.clone(), drv.clone());
        inner.paths.insert(path.clone(), info);
        path
    }

    pub fn add_realisation(&self, realisation: Realisation) {
        self.inner()
            .realisations
            .insert(realisation.id.clone(), realisation);
    }

    /// Pretend a valid path's contents were damaged on disk.
    pub fn mark_corrupt(&self, path: &StorePath) {
        self.inner().corrupt.insert(path.clone());
    }

    /// Paths registered through [`Store::register_valid_path`], in order.
    pub fn registration_log(&self) -> Vec<StorePath> {
        self.inner().registration_log.clone()
    }

    pub fn valid_paths(&self) -> BTreeSet<StorePath> {
        self.inner().paths.keys().cloned().collect()
    }

    /// Hold locks on `paths` as another process would.
    pub fn lock_externally(&self, paths: BTreeSet<StorePath>) -> Option<PathLock> {
        self.try_lock_paths(&paths).ok().flatten()
    }
}

impl Store for MemoryStore {
    fn is_valid_path(&self, path: &StorePath) -> bool {
        self.inner().paths.contains_key(path)
    }

    fn query_path_info(&self, path: &StorePath) -> Option<PathInfo> {
        self.inner().paths.get(path).cloned()
    }

    fn register_valid_path(&self, info: PathInfo) -> Result<()> {
        let mut inner = self.inner();
        if let Some(missing) = info
            .references_excluding_self()
            .find(|r| !inner.paths.contains_key(*r))
        {
            return Err(RealiserError::InvalidPath(missing.clone()));
        }

        trace!(path = %info.path, "registering valid path");
        inner.corrupt.remove(&info.path);
        inner.registration_log.push(info.path.clone());
        inner.paths.insert(info.path.clone(), info);
        Ok(())
    }

    fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation> {
        self.inner()
            .derivations
            .get(drv_path)
            .cloned()
            .ok_or_else(|| RealiserError::MissingDerivation(drv_path.clone()))
    }

    fn write_derivation(&self, drv: &Derivation) -> Result<StorePath> {
        Ok(self.add_derivation(drv))
    }

    fn query_realisation(&self, id: &DrvOutput) -> Option<Realisation> {
        self.inner().realisations.get(id).cloned()
    }

    fn register_realisation(&self, realisation: Realisation) -> Result<()> {
        let mut inner = self.inner();
        if !inner.paths.contains_key(&realisation.out_path) {
            return Err(RealiserError::InvalidPath(realisation.out_path));
        }
        inner.realisations.insert(realisation.id.clone(), realisation);
        Ok(())
    }

    fn verify_path_contents(&self, path: &StorePath) -> bool {
        let inner = self.inner();
        inner.paths.contains_key(path) && !inner.corrupt.contains(path)
    }

    fn try_lock_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Option<PathLock>> {
        let mut held = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if paths.iter().any(|p| held.contains(p)) {
            return Ok(None);
        }
        held.extend(paths.iter().cloned());

        let locks = Arc::clone(&self.locks);
        let released = paths.clone();
        Ok(Some(PathLock::new(paths.clone(), move || {
            let mut held = locks.lock().unwrap_or_else(|e| e.into_inner());
            for p in &released {
                held.remove(p);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> StorePath {
        StorePath::from_hash_and_name("0000", name)
    }

    #[test]
    fn registration_requires_valid_references() {
        let store = MemoryStore::new();
        let mut info = PathInfo::new(path("app"));
        info.references.insert(path("lib"));
        info.references.insert(path("app"));

        assert!(store.register_valid_path(info.clone()).is_err());
        store.register_valid_path(PathInfo::new(path("lib"))).unwrap();
        store.register_valid_path(info).unwrap();
        assert_eq!(store.registration_log(), vec![path("lib"), path("app")]);
    }

    #[test]
    fn locks_are_exclusive_until_dropped() {
        let store = MemoryStore::new();
        let set = BTreeSet::from([path("out")]);
        let held = store.try_lock_paths(&set).unwrap();
        assert!(held.is_some());
        assert!(store.try_lock_paths(&set).unwrap().is_none());
        drop(held);
        assert!(store.try_lock_paths(&set).unwrap().is_some());
    }

    #[test]
    fn closure_follows_references() {
        let store = MemoryStore::new();
        store.add_valid_path(PathInfo::new(path("libc")));
        let mut lib = PathInfo::new(path("lib"));
        lib.references.insert(path("libc"));
        store.add_valid_path(lib);
        let mut app = PathInfo::new(path("app"));
        app.references.insert(path("lib"));
        store.add_valid_path(app);

        let closure = store.compute_closure(&BTreeSet::from([path("app")]));
        assert_eq!(closure.len(), 3);
        assert!(closure.contains(&path("libc")));
    }
}
