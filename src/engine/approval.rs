use ulid::Ulid;

use crate::model::{Approval, Ms};

use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
    Approve { by: Option<Ulid>, at: Ms },
    Reject { by: Option<Ulid>, at: Ms, reason: Option<String> },
}

/// pending -> approved | rejected. Every other transition is `NotPending`.
pub(crate) fn transition(
    schedule_id: Ulid,
    current: &Approval,
    decision: Decision,
) -> Result<Approval, EngineError> {
    if !current.is_pending() {
        return Err(EngineError::NotPending(schedule_id));
    }
    Ok(match decision {
        Decision::Approve { by, at } => Approval::Approved { by, at },
        Decision::Reject { by, at, reason } => Approval::Rejected { by, at, reason },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Approval {
        Approval::Pending { proposed_by: Ulid::new(), notes: Some("HIIT block".into()) }
    }

    #[test]
    fn pending_moves_to_either_outcome() {
        let id = Ulid::new();
        let admin = Some(Ulid::new());
        let approved = transition(id, &pending(), Decision::Approve { by: admin, at: 5 }).unwrap();
        assert_eq!(approved, Approval::Approved { by: admin, at: 5 });

        let rejected = transition(
            id,
            &pending(),
            Decision::Reject { by: admin, at: 6, reason: Some("room closed".into()) },
        )
        .unwrap();
        assert_eq!(rejected.note(), Some("room closed"));
    }

    #[test]
    fn decided_schedules_are_final() {
        let id = Ulid::new();
        let approved = Approval::Approved { by: None, at: 1 };
        let rejected = Approval::Rejected { by: None, at: 1, reason: None };
        for current in [approved, rejected] {
            for decision in [
                Decision::Approve { by: None, at: 2 },
                Decision::Reject { by: None, at: 2, reason: None },
            ] {
                assert!(matches!(
                    transition(id, &current, decision),
                    Err(EngineError::NotPending(e)) if e == id
                ));
            }
        }
    }
}
