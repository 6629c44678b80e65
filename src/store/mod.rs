//! Durable run storage
//!
//! The engine persists the full [`RunState`] after every step through the
//! [`RunStore`] trait. [`MemoryRunStore`] backs tests and ephemeral runs;
//! [`PostgresRunStore`] is the production implementation.
//!
//! Cancellation is a store-side flag rather than a field of [`RunState`]:
//! a cancel can land while the engine holds a stale in-memory state, and
//! keeping the flag in the store means a subsequent save cannot clobber
//! it.

pub mod postgres;

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{RunState, RunStatus};

pub use postgres::PostgresRunStore;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run; fails if the id already exists
    async fn create(&self, state: &RunState) -> Result<()>;

    async fn load(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Persist the current state of a run
    ///
    /// If cancellation was requested in the meantime the stored status
    /// becomes Cancelled regardless of the state being saved.
    async fn save(&self, state: &RunState) -> Result<()>;

    /// Request cancellation; returns false when the run is unknown or
    /// already terminal
    async fn mark_cancelled(&self, run_id: &str) -> Result<bool>;

    async fn is_cancelled(&self, run_id: &str) -> Result<bool>;
}

/// In-memory store for tests and one-shot CLI runs
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, RunState>,
    cancelled: HashSet<String>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, state: &RunState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.runs.contains_key(&state.run_id) {
            return Err(anyhow!("run '{}' already exists", state.run_id));
        }
        inner.runs.insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(run_id).cloned())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut state = state.clone();
        if inner.cancelled.contains(&state.run_id) {
            state.status = RunStatus::Cancelled;
        }
        inner.runs.insert(state.run_id.clone(), state);
        Ok(())
    }

    async fn mark_cancelled(&self, run_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.runs.get_mut(run_id) else {
            return Ok(false);
        };
        if state.is_terminal() {
            return Ok(false);
        }
        state.status = RunStatus::Cancelled;
        inner.cancelled.insert(run_id.to_string());
        Ok(true)
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.cancelled.contains(run_id))
    }
}
