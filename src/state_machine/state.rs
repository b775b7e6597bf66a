use std::fmt;

use serde::{Deserialize, Serialize};

/// The states an MVP moves through on its way to a terminal outcome.
///
/// Happy path: CREATED → IDEATING → ARCHITECTING → BUILDING → DEPLOYING
/// → TOKENIZING → COMPLETED. Build and deploy each have a recoverable
/// failure state that loops back into the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MvpState {
    Created,
    Ideating,
    Architecting,
    Building,
    BuildFailed,
    Deploying,
    DeployFailed,
    Tokenizing,
    Completed,
    Failed,
}

impl fmt::Display for MvpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MvpState::Created => "CREATED",
            MvpState::Ideating => "IDEATING",
            MvpState::Architecting => "ARCHITECTING",
            MvpState::Building => "BUILDING",
            MvpState::BuildFailed => "BUILD_FAILED",
            MvpState::Deploying => "DEPLOYING",
            MvpState::DeployFailed => "DEPLOY_FAILED",
            MvpState::Tokenizing => "TOKENIZING",
            MvpState::Completed => "COMPLETED",
            MvpState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Every state, in pipeline order. Used by the integrity check and tests.
pub const ALL_STATES: &[MvpState] = &[
    MvpState::Created,
    MvpState::Ideating,
    MvpState::Architecting,
    MvpState::Building,
    MvpState::BuildFailed,
    MvpState::Deploying,
    MvpState::DeployFailed,
    MvpState::Tokenizing,
    MvpState::Completed,
    MvpState::Failed,
];

/// States eligible for crash recovery and blocked by the admission guard.
pub const NON_TERMINAL_STATES: &[MvpState] = &[
    MvpState::Created,
    MvpState::Ideating,
    MvpState::Architecting,
    MvpState::Building,
    MvpState::BuildFailed,
    MvpState::Deploying,
    MvpState::DeployFailed,
    MvpState::Tokenizing,
];

/// The exhaustive transition table.
pub fn valid_next_states(from: MvpState) -> &'static [MvpState] {
    match from {
        MvpState::Created => &[MvpState::Ideating],
        MvpState::Ideating => &[MvpState::Architecting, MvpState::Failed],
        MvpState::Architecting => &[MvpState::Building, MvpState::Failed],
        MvpState::Building => &[MvpState::Deploying, MvpState::BuildFailed],
        MvpState::BuildFailed => &[MvpState::Building, MvpState::Failed],
        MvpState::Deploying => &[MvpState::Tokenizing, MvpState::DeployFailed],
        MvpState::DeployFailed => &[MvpState::Deploying, MvpState::Failed],
        MvpState::Tokenizing => &[MvpState::Completed, MvpState::Failed],
        MvpState::Completed => &[],
        MvpState::Failed => &[],
    }
}

/// True iff `to` appears in the transition table entry for `from`.
pub fn is_valid_transition(from: MvpState, to: MvpState) -> bool {
    valid_next_states(from).contains(&to)
}

/// COMPLETED and FAILED have no outgoing transitions.
pub fn is_terminal_state(state: MvpState) -> bool {
    matches!(state, MvpState::Completed | MvpState::Failed)
}

pub fn is_non_terminal_state(state: MvpState) -> bool {
    !is_terminal_state(state)
}

/// Sanity-check the transition table shape. Returns an error message on
/// the first inconsistency found.
pub fn validate_table_integrity() -> Result<(), String> {
    for &state in ALL_STATES {
        if is_terminal_state(state) && !valid_next_states(state).is_empty() {
            return Err(format!("terminal state {state} has outgoing transitions"));
        }
        if is_non_terminal_state(state) && valid_next_states(state).is_empty() {
            return Err(format!("non-terminal state {state} is a dead end"));
        }
    }
    for &state in NON_TERMINAL_STATES {
        if is_terminal_state(state) {
            return Err(format!("{state} listed as non-terminal"));
        }
    }
    Ok(())
}
