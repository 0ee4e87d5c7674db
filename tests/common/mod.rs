#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use realiser::config::WorkerSettings;
use realiser::store::Store;
use realiser::{Derivation, MemoryStore, StorePath, SubstituterRef, Worker};
use realiser_test_utils::fake_executor::FakeExecutor;

pub use realiser_test_utils::{init_tracing, with_timeout};

/// Key every test cache signs with.
pub const KEY: &str = "cache.example.org-1";

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        trusted_public_keys: vec![KEY.to_string()],
        poll_interval: Duration::from_millis(20),
        ..WorkerSettings::default()
    }
}

/// A store and a fake executor shared by the workers of one test.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub executor: FakeExecutor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_executor(FakeExecutor::new())
    }

    pub fn with_executor(executor: FakeExecutor) -> Self {
        Harness {
            store: Arc::new(MemoryStore::new()),
            executor,
        }
    }

    pub fn add(&self, drv: &Derivation) -> StorePath {
        self.store.add_derivation(drv)
    }

    pub fn worker(&self, settings: WorkerSettings) -> Worker {
        self.worker_with(settings, Vec::new())
    }

    pub fn worker_with(&self, settings: WorkerSettings, subs: Vec<SubstituterRef>) -> Worker {
        let store: Arc<dyn Store> = self.store.clone();
        Worker::new(store, Arc::new(self.executor.clone()), settings).with_substituters(subs)
    }
}
