//! Workflow-state handles
//!
//! The engine does not run steps itself. Every running execution owns one
//! handle in a workflow-state provider, which tracks the in-flight position
//! and its transition history. The provider is a collaborator injected into
//! the services; [`LocalWorkflowStates`] keeps handles in process memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::now;

/// Opaque correlation id of an in-flight run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowHandle(pub String);

impl WorkflowHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowStateError {
    #[error("Unknown workflow state handle: {0}")]
    UnknownHandle(WorkflowHandle),

    #[error("Workflow state {0} has already been cancelled")]
    AlreadyCancelled(WorkflowHandle),

    #[error("Workflow state provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTransition {
    /// Tag such as "step_advanced" or "workflow_cancelled"
    pub event: String,
    pub step_id: Option<String>,
    pub actor_id: Option<String>,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub handle: WorkflowHandle,
    pub process_id: String,
    pub phase: WorkflowPhase,
    pub current_step_id: Option<String>,
    pub initialized_by: String,
    pub initialized_at: DateTime<Utc>,
    pub history: Vec<WorkflowTransition>,
}

impl WorkflowState {
    pub fn last_transition(&self) -> Option<&WorkflowTransition> {
        self.history.last()
    }
}

#[async_trait]
pub trait WorkflowStateProvider: Send + Sync {
    async fn initialize(
        &self,
        process_id: &str,
        actor_id: &str,
        input_data: &JsonValue,
    ) -> Result<WorkflowHandle, WorkflowStateError>;

    async fn advance(
        &self,
        handle: &WorkflowHandle,
        next_step_id: &str,
    ) -> Result<(), WorkflowStateError>;

    async fn cancel(
        &self,
        handle: &WorkflowHandle,
        reason: &str,
        actor_id: &str,
    ) -> Result<(), WorkflowStateError>;

    async fn get_state(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Option<WorkflowState>, WorkflowStateError>;

    /// Forget a handle whose run is over or never started
    ///
    /// Releasing an unknown handle succeeds.
    async fn release(&self, handle: &WorkflowHandle) -> Result<(), WorkflowStateError>;
}

/// Cancelled states kept around for log reads by default
pub const DEFAULT_CANCELLED_RETENTION: usize = 1024;

#[derive(Debug, Default)]
struct Handles {
    states: HashMap<WorkflowHandle, WorkflowState>,
    /// Cancelled handles, oldest first
    cancelled: VecDeque<WorkflowHandle>,
}

/// In-process provider
///
/// Active handles live until released. Cancelled ones are kept for log reads,
/// at most `retention` of them; the oldest are dropped first.
#[derive(Debug)]
pub struct LocalWorkflowStates {
    handles: RwLock<Handles>,
    retention: usize,
}

impl Default for LocalWorkflowStates {
    fn default() -> Self {
        Self::with_retention(DEFAULT_CANCELLED_RETENTION)
    }
}

impl LocalWorkflowStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            handles: RwLock::new(Handles::default()),
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.states.len()
    }
}

#[async_trait]
impl WorkflowStateProvider for LocalWorkflowStates {
    async fn initialize(
        &self,
        process_id: &str,
        actor_id: &str,
        _input_data: &JsonValue,
    ) -> Result<WorkflowHandle, WorkflowStateError> {
        let handle = WorkflowHandle(format!("wfs_{}", Uuid::new_v4()));
        let state = WorkflowState {
            handle: handle.clone(),
            process_id: process_id.to_string(),
            phase: WorkflowPhase::Active,
            current_step_id: None,
            initialized_by: actor_id.to_string(),
            initialized_at: now(),
            history: Vec::new(),
        };

        self.handles.write().await.states.insert(handle.clone(), state);
        tracing::debug!(%handle, process_id, "workflow state initialized");
        Ok(handle)
    }

    async fn advance(
        &self,
        handle: &WorkflowHandle,
        next_step_id: &str,
    ) -> Result<(), WorkflowStateError> {
        let mut handles = self.handles.write().await;
        let state = handles
            .states
            .get_mut(handle)
            .ok_or_else(|| WorkflowStateError::UnknownHandle(handle.clone()))?;
        if state.phase == WorkflowPhase::Cancelled {
            return Err(WorkflowStateError::AlreadyCancelled(handle.clone()));
        }

        state.current_step_id = Some(next_step_id.to_string());
        state.history.push(WorkflowTransition {
            event: "step_advanced".to_string(),
            step_id: Some(next_step_id.to_string()),
            actor_id: None,
            reason: None,
            at: now(),
        });
        Ok(())
    }

    async fn cancel(
        &self,
        handle: &WorkflowHandle,
        reason: &str,
        actor_id: &str,
    ) -> Result<(), WorkflowStateError> {
        let mut handles = self.handles.write().await;
        let state = handles
            .states
            .get_mut(handle)
            .ok_or_else(|| WorkflowStateError::UnknownHandle(handle.clone()))?;
        if state.phase == WorkflowPhase::Cancelled {
            return Err(WorkflowStateError::AlreadyCancelled(handle.clone()));
        }

        state.phase = WorkflowPhase::Cancelled;
        state.history.push(WorkflowTransition {
            event: "workflow_cancelled".to_string(),
            step_id: state.current_step_id.clone(),
            actor_id: Some(actor_id.to_string()),
            reason: Some(reason.to_string()),
            at: now(),
        });

        handles.cancelled.push_back(handle.clone());
        while handles.cancelled.len() > self.retention {
            if let Some(evicted) = handles.cancelled.pop_front() {
                handles.states.remove(&evicted);
                tracing::debug!(handle = %evicted, "cancelled workflow state evicted");
            }
        }
        Ok(())
    }

    async fn get_state(
        &self,
        handle: &WorkflowHandle,
    ) -> Result<Option<WorkflowState>, WorkflowStateError> {
        Ok(self.handles.read().await.states.get(handle).cloned())
    }

    async fn release(&self, handle: &WorkflowHandle) -> Result<(), WorkflowStateError> {
        let mut handles = self.handles.write().await;
        if let Some(state) = handles.states.remove(handle) {
            if state.phase == WorkflowPhase::Cancelled {
                handles.cancelled.retain(|cancelled| cancelled != handle);
            }
            tracing::debug!(%handle, "workflow state released");
        }
        Ok(())
    }
}
