use futures::future::try_join_all;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::error::Result;
use crate::rlm::Rlm;

/// Lets sandboxed code start a nested completion over a sub-document.
///
/// Sandboxed code is synchronous while the engine is async, so the bridge
/// offers both a suspending entry point and a blocking one. The blocking one
/// is only ever called from a session's interpreter thread, which sits
/// outside the runtime, and drives the child on `handle`.
#[derive(Clone)]
pub struct RecursiveBridge {
    parent: Rlm,
    handle: Handle,
}

impl RecursiveBridge {
    pub fn new(parent: Rlm, handle: Handle) -> Self {
        Self { parent, handle }
    }

    /// Depth the child sessions run at.
    pub fn child_depth(&self) -> u32 {
        self.parent.depth() + 1
    }

    /// `Some(sentinel)` when no child may be started below this depth.
    fn exhausted(&self) -> Option<String> {
        let max_depth = self.parent.config().max_depth;
        if self.child_depth() >= max_depth {
            debug!(depth = self.parent.depth(), max_depth, "Recursive call refused");
            Some(depth_sentinel(max_depth))
        } else {
            None
        }
    }

    pub async fn call(&self, sub_query: &str, sub_context: &str) -> Result<String> {
        if let Some(sentinel) = self.exhausted() {
            return Ok(sentinel);
        }
        info!(
            depth = self.child_depth(),
            sub_context_len = sub_context.len(),
            "Starting recursive completion"
        );
        self.parent.spawn_child().completion(sub_query, sub_context).await
    }

    /// Run several children concurrently; answers come back in input order.
    /// The first failure fails the whole batch.
    pub async fn call_many(&self, requests: Vec<(String, String)>) -> Result<Vec<String>> {
        if let Some(sentinel) = self.exhausted() {
            return Ok(vec![sentinel; requests.len()]);
        }
        info!(
            depth = self.child_depth(),
            count = requests.len(),
            "Starting recursive batch"
        );
        let children = requests.iter().map(|(sub_query, sub_context)| {
            let child = self.parent.spawn_child();
            async move { child.completion(sub_query, sub_context).await }
        });
        try_join_all(children).await
    }

    /// Blocking form of [`call`](Self::call). Must not be called from inside
    /// the runtime that owns `handle`.
    pub fn call_blocking(&self, sub_query: &str, sub_context: &str) -> Result<String> {
        self.handle.block_on(self.call(sub_query, sub_context))
    }

    /// Blocking form of [`call_many`](Self::call_many).
    pub fn call_many_blocking(&self, requests: Vec<(String, String)>) -> Result<Vec<String>> {
        self.handle.block_on(self.call_many(requests))
    }
}

pub fn depth_sentinel(max_depth: u32) -> String {
    format!("Max recursion depth ({}) reached", max_depth)
}
