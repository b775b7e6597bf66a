//! In-memory repository for MVPs and their stage-attempt log.
//!
//! A concrete storage engine is out of scope; this store keeps both
//! tables behind `RwLock<HashMap>` and is the unit of mutual exclusion
//! for each MVP row. All status changes go through [`MvpStore::transition_state`],
//! and the attempt log is append-only: a record is opened once and
//! closed exactly once.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::state_machine::{
    AttemptStatus, Mvp, MvpState, StageAttempt, is_non_terminal_state, is_terminal_state,
    is_valid_transition,
};

const MAX_NAME_LEN: usize = 200;

#[derive(Default)]
pub struct MvpStore {
    mvps: RwLock<HashMap<Uuid, Mvp>>,
    attempts: RwLock<HashMap<Uuid, Vec<StageAttempt>>>,
}

// A poisoned lock means a writer panicked mid-update; the maps are still
// structurally sound, so recover the guard rather than propagate.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MvpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new MVP in the CREATED state.
    pub fn create_mvp(
        &self,
        name: &str,
        idea_summary: Option<String>,
    ) -> Result<Mvp, PipelineError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Validation("MVP name cannot be empty".into()));
        }
        if trimmed.len() > MAX_NAME_LEN {
            return Err(PipelineError::Validation(format!(
                "MVP name cannot exceed {MAX_NAME_LEN} characters"
            )));
        }

        let mvp = Mvp::new(trimmed.to_string(), idea_summary);
        write_lock(&self.mvps).insert(mvp.id, mvp.clone());
        Ok(mvp)
    }

    pub fn get(&self, mvp_id: Uuid) -> Result<Mvp, PipelineError> {
        read_lock(&self.mvps)
            .get(&mvp_id)
            .cloned()
            .ok_or(PipelineError::NotFound(mvp_id))
    }

    /// All MVPs, newest first.
    pub fn list(&self) -> Vec<Mvp> {
        let mut mvps: Vec<Mvp> = read_lock(&self.mvps).values().cloned().collect();
        mvps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        mvps
    }

    /// MVPs eligible for crash recovery.
    pub fn list_non_terminal(&self) -> Vec<Mvp> {
        let mut mvps: Vec<Mvp> = read_lock(&self.mvps)
            .values()
            .filter(|m| is_non_terminal_state(m.status))
            .cloned()
            .collect();
        mvps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        mvps
    }

    /// Admission guard: reject starting a run for an MVP that is already
    /// in flight. Must be called before the orchestrator is spawned.
    pub fn check_pipeline_conflict(&self, mvp_id: Uuid) -> Result<(), PipelineError> {
        let mvp = self.get(mvp_id)?;
        // CREATED means no run has started yet, so it is admissible.
        if mvp.status != MvpState::Created && is_non_terminal_state(mvp.status) {
            return Err(PipelineError::PipelineConflict {
                mvp_id,
                status: mvp.status,
            });
        }
        Ok(())
    }

    /// Validated state transition. Updates `status` and `updated_at`
    /// atomically under the store lock.
    pub fn transition_state(&self, mvp_id: Uuid, to: MvpState) -> Result<Mvp, PipelineError> {
        let mut mvps = write_lock(&self.mvps);
        let mvp = mvps.get_mut(&mvp_id).ok_or(PipelineError::NotFound(mvp_id))?;

        if !is_valid_transition(mvp.status, to) {
            return Err(PipelineError::StateTransition {
                from: mvp.status,
                to,
            });
        }

        mvp.status = to;
        mvp.updated_at = Utc::now();
        Ok(mvp.clone())
    }

    /// Terminal abort. The transition table has no FAILED edge out of
    /// every in-flight state (BUILDING, DEPLOYING), but guardrail
    /// violations must always end terminal, so this sets FAILED without
    /// consulting the table. Already-terminal MVPs are left untouched.
    pub fn force_fail(&self, mvp_id: Uuid) -> Result<Mvp, PipelineError> {
        let mut mvps = write_lock(&self.mvps);
        let mvp = mvps.get_mut(&mvp_id).ok_or(PipelineError::NotFound(mvp_id))?;
        if !is_terminal_state(mvp.status) {
            mvp.status = MvpState::Failed;
            mvp.updated_at = Utc::now();
        }
        Ok(mvp.clone())
    }

    /// Apply a non-state mutation (retry bookkeeping, totals, artifacts).
    /// Status must not be touched here; use [`MvpStore::transition_state`].
    pub fn update<F>(&self, mvp_id: Uuid, mutate: F) -> Result<Mvp, PipelineError>
    where
        F: FnOnce(&mut Mvp),
    {
        let mut mvps = write_lock(&self.mvps);
        let mvp = mvps.get_mut(&mvp_id).ok_or(PipelineError::NotFound(mvp_id))?;
        let status_before = mvp.status;
        mutate(mvp);
        mvp.status = status_before;
        mvp.updated_at = Utc::now();
        Ok(mvp.clone())
    }

    /// Append a freshly opened attempt record.
    pub fn record_attempt_open(&self, attempt: &StageAttempt) {
        write_lock(&self.attempts)
            .entry(attempt.mvp_id)
            .or_default()
            .push(attempt.clone());
    }

    /// Close a previously opened attempt. Each record closes exactly once.
    pub fn record_attempt_close(&self, attempt: &StageAttempt) -> Result<(), PipelineError> {
        let mut attempts = write_lock(&self.attempts);
        let log = attempts
            .get_mut(&attempt.mvp_id)
            .ok_or(PipelineError::NotFound(attempt.mvp_id))?;
        let stored = log
            .iter_mut()
            .find(|a| a.id == attempt.id)
            .ok_or(PipelineError::NotFound(attempt.id))?;

        if stored.status != AttemptStatus::Running {
            return Err(PipelineError::Validation(format!(
                "stage attempt {} already closed",
                attempt.id
            )));
        }
        *stored = attempt.clone();
        Ok(())
    }

    /// Attempt log for one MVP, ordered by start time.
    pub fn attempts_for(&self, mvp_id: Uuid) -> Vec<StageAttempt> {
        let mut log = read_lock(&self.attempts)
            .get(&mvp_id)
            .cloned()
            .unwrap_or_default();
        log.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        log
    }
}
