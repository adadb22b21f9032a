use crate::error::StateMachineError;
use crate::types::{AttemptHandle, IncidentState};

/// Validates a state transition against the edge table.
pub fn validate_transition(from: IncidentState, to: IncidentState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: IncidentState) -> Vec<IncidentState> {
    use IncidentState::*;
    match from {
        New => vec![Dispatching, Escalated],
        Dispatching => vec![Monitoring, Dispatching, Escalated],
        Monitoring => vec![Resolved, Dispatching, Escalated],
        Resolved => vec![],
        Escalated => vec![],
    }
}

fn allowed(from: IncidentState, to: IncidentState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Attempt number an edge must carry given the current attempt count.
///
/// Entering `Dispatching` starts a new attempt; every other edge keeps the count.
#[must_use]
pub fn expected_attempt(to: IncidentState, attempt_count: u32) -> u32 {
    if to == IncidentState::Dispatching {
        attempt_count + 1
    } else {
        attempt_count
    }
}

/// Validates a full event: edge legality, attempt accounting and handle presence.
///
/// `from == None` denotes the creation event, which must enter `New` at attempt 0.
pub fn validate_event(
    from: Option<IncidentState>,
    to: IncidentState,
    attempt_count: u32,
    attempt_number: u32,
    handle: Option<&AttemptHandle>,
) -> Result<(), StateMachineError> {
    let Some(from) = from else {
        if to != IncidentState::New || attempt_number != 0 {
            return Err(StateMachineError::MissingCreation);
        }
        return Ok(());
    };

    validate_transition(from, to)?;

    let expected = expected_attempt(to, attempt_count);
    if attempt_number != expected {
        return Err(StateMachineError::AttemptMismatch {
            from,
            to,
            expected,
            actual: attempt_number,
        });
    }

    if to == IncidentState::Monitoring && handle.is_none() {
        return Err(StateMachineError::MissingHandle);
    }
    Ok(())
}
