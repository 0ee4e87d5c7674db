#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use realiser::store::Store;
use realiser::substituter::{MemorySubstituter, Substituter, SubstituterError, SubstituterResult};
use realiser::types::{DrvOutput, PathInfo, StorePath, UnkeyedRealisation};

/// A [`MemorySubstituter`] that can be told to misbehave.
///
/// Counts queries and copies, optionally sleeps in every call to make
/// helper threads overlap, and tracks how many copies ran at once.
#[derive(Debug)]
pub struct FlakySubstituter {
    inner: MemorySubstituter,
    faults: Mutex<Faults>,
    delay: Duration,
    queries: AtomicUsize,
    copies: AtomicUsize,
    copying: AtomicUsize,
    max_copying: AtomicUsize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_queries: bool,
    /// Remaining copies that fail with a transport error.
    failing_copies: usize,
    /// Paths that disappear between query and copy.
    vanishing: Vec<StorePath>,
}

impl FlakySubstituter {
    pub fn new(uri: &str) -> Self {
        Self::wrap(MemorySubstituter::new(uri))
    }

    pub fn wrap(inner: MemorySubstituter) -> Self {
        FlakySubstituter {
            inner,
            faults: Mutex::new(Faults::default()),
            delay: Duration::ZERO,
            queries: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            copying: AtomicUsize::new(0),
            max_copying: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_path(&self, info: PathInfo) {
        self.inner.add_path(info);
    }

    pub fn add_realisation(&self, id: DrvOutput, value: UnkeyedRealisation) {
        self.inner.add_realisation(id, value);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.faults().fail_queries = fail;
    }

    pub fn fail_next_copies(&self, n: usize) {
        self.faults().failing_copies = n;
    }

    /// Advertise `path` but make it disappear as soon as it is fetched.
    pub fn vanish_on_copy(&self, path: &StorePath) {
        self.faults().vanishing.push(path.clone());
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_copies(&self) -> usize {
        self.max_copying.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl Substituter for FlakySubstituter {
    fn uri(&self) -> &str {
        self.inner.uri()
    }

    fn is_trusted(&self) -> bool {
        self.inner.is_trusted()
    }

    fn query_path_info(&self, path: &StorePath) -> SubstituterResult<Option<PathInfo>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.pause();
        if self.faults().fail_queries {
            return Err(SubstituterError::Transport(format!(
                "connection to {} reset",
                self.uri()
            )));
        }
        self.inner.query_path_info(path)
    }

    fn query_realisation(&self, id: &DrvOutput) -> SubstituterResult<Option<UnkeyedRealisation>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.pause();
        if self.faults().fail_queries {
            return Err(SubstituterError::Transport(format!(
                "connection to {} reset",
                self.uri()
            )));
        }
        self.inner.query_realisation(id)
    }

    fn copy_path(&self, info: &PathInfo, dest: &dyn Store) -> SubstituterResult<()> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let now = self.copying.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_copying.fetch_max(now, Ordering::SeqCst);

        self.pause();
        let result = {
            let mut faults = self.faults();
            if faults.failing_copies > 0 {
                faults.failing_copies -= 1;
                Err(SubstituterError::Transport("download interrupted".to_string()))
            } else if faults.vanishing.contains(&info.path) {
                drop(faults);
                self.inner.remove_path(&info.path);
                Err(SubstituterError::Gone(info.path.clone()))
            } else {
                drop(faults);
                self.inner.copy_path(info, dest)
            }
        };

        self.copying.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
