#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use realiser::exec::{BuildHook, BuildRequest, HookReply, LocalExecutor};
use realiser::types::StorePath;

use crate::fake_executor::FakeExecutor;

/// What a [`ScriptedHook`] answers to the next offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Accept,
    Decline,
    DeclinePermanently,
    Postpone,
}

/// A build hook replaying a fixed list of answers, then declining.
///
/// Accepted builds are "run remotely" on its own [`FakeExecutor`], so tests
/// can tell local and remote builds apart.
#[derive(Debug)]
pub struct ScriptedHook {
    script: VecDeque<Scripted>,
    remote: FakeExecutor,
    offers: Arc<Mutex<Vec<StorePath>>>,
}

impl ScriptedHook {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        ScriptedHook {
            script: script.into_iter().collect(),
            remote: FakeExecutor::new(),
            offers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The executor accepted builds run on.
    pub fn remote(&self) -> FakeExecutor {
        self.remote.clone()
    }

    /// Shared record of the derivations offered, in order.
    pub fn offers(&self) -> Arc<Mutex<Vec<StorePath>>> {
        Arc::clone(&self.offers)
    }
}

impl BuildHook for ScriptedHook {
    fn offer(&mut self, request: &BuildRequest) -> HookReply {
        self.offers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.drv_path.clone());

        match self.script.pop_front().unwrap_or(Scripted::Decline) {
            Scripted::Accept => match self.remote.start_build(request.clone()) {
                Ok(job) => HookReply::Accept(job),
                Err(_) => HookReply::Decline,
            },
            Scripted::Decline => HookReply::Decline,
            Scripted::DeclinePermanently => HookReply::DeclinePermanently,
            Scripted::Postpone => HookReply::Postpone,
        }
    }
}
