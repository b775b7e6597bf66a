mod record;
mod state;

pub use record::{AttemptStatus, DEFAULT_MAX_ALLOWED_COST, Mvp, StageAttempt};
pub use state::{
    ALL_STATES, MvpState, NON_TERMINAL_STATES, is_non_terminal_state, is_terminal_state,
    is_valid_transition, valid_next_states, validate_table_integrity,
};
