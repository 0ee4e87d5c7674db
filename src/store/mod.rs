// src/store/mod.rs

//! The store the scheduler realises paths into.
//!
//! The store is shared between the scheduler task and substitution helper
//! threads, so implementations must be internally synchronised.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::{self, Debug};

use crate::derivation::Derivation;
use crate::errors::{RealiserError, Result};
use crate::types::{DrvOutput, OutputPathMap, PathInfo, Realisation, SingleDerivedPath, StorePath};

pub mod memory;

pub use memory::MemoryStore;

pub trait Store: Send + Sync + Debug {
    fn is_valid_path(&self, path: &StorePath) -> bool;

    fn query_path_info(&self, path: &StorePath) -> Option<PathInfo>;

    /// Make `info.path` valid. Every reference other than the path itself
    /// must already be valid.
    fn register_valid_path(&self, info: PathInfo) -> Result<()>;

    fn read_derivation(&self, drv_path: &StorePath) -> Result<Derivation>;

    /// Add a derivation to the store and return its path.
    fn write_derivation(&self, drv: &Derivation) -> Result<StorePath>;

    /// Look up the build trace.
    fn query_realisation(&self, id: &DrvOutput) -> Option<Realisation>;

    fn register_realisation(&self, realisation: Realisation) -> Result<()>;

    /// Whether a valid path's contents still match its metadata.
    fn verify_path_contents(&self, path: &StorePath) -> bool;

    /// Take exclusive locks on `paths` without blocking. `Ok(None)` means
    /// somebody else holds at least one of them.
    fn try_lock_paths(&self, paths: &BTreeSet<StorePath>) -> Result<Option<PathLock>>;

    /// Output paths of a derivation where known, consulting the build trace
    /// for floating outputs.
    fn query_partial_derivation_output_map(&self, drv_path: &StorePath) -> Result<OutputPathMap> {
        let drv = self.read_derivation(drv_path)?;
        Ok(drv
            .outputs
            .iter()
            .map(|(name, out)| {
                let path = out.path().cloned().or_else(|| {
                    self.query_realisation(&DrvOutput::new(drv_path.clone(), name.clone()))
                        .map(|r| r.out_path)
                });
                (name.clone(), path)
            })
            .collect())
    }

    /// `roots` plus everything reachable from them through references of
    /// valid paths.
    fn compute_closure(&self, roots: &BTreeSet<StorePath>) -> BTreeSet<StorePath> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<StorePath> = roots.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            if !closure.insert(path.clone()) {
                continue;
            }
            if let Some(info) = self.query_path_info(&path) {
                queue.extend(info.references.into_iter().filter(|r| !closure.contains(r)));
            }
        }
        closure
    }
}

/// Held output locks; released on drop.
pub struct PathLock {
    paths: BTreeSet<StorePath>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PathLock {
    pub fn new(paths: BTreeSet<StorePath>, release: impl FnOnce() + Send + 'static) -> Self {
        PathLock {
            paths,
            release: Some(Box::new(release)),
        }
    }

    pub fn paths(&self) -> &BTreeSet<StorePath> {
        &self.paths
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Debug for PathLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathLock").field("paths", &self.paths).finish()
    }
}

/// Resolve a possibly dynamic reference to the concrete path it denotes,
/// using only what the store already knows.
pub fn resolve_derived_path(store: &dyn Store, path: &SingleDerivedPath) -> Result<StorePath> {
    match path {
        SingleDerivedPath::Opaque(p) => Ok(p.clone()),
        SingleDerivedPath::Built { drv_path, output } => {
            let drv = resolve_derived_path(store, drv_path)?;
            let outputs = if store.is_valid_path(&drv) {
                store.query_partial_derivation_output_map(&drv)?
            } else {
                Default::default()
            };
            let known = outputs.get(output).cloned().flatten().or_else(|| {
                store
                    .query_realisation(&DrvOutput::new(drv.clone(), output.clone()))
                    .map(|r| r.out_path)
            });
            known.ok_or_else(|| RealiserError::MissingRealisation(path.to_string()))
        }
    }
}
