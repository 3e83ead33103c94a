use ulid::Ulid;

use crate::model::{ClassState, ClassStatus};

use super::EngineError;

/// Whether one more seat can be taken. Callers hold the class write lock and
/// apply the seat through `reserve` once the booking is durable.
pub(crate) fn try_reserve(class: &ClassState) -> Result<(), EngineError> {
    if class.status != ClassStatus::Active || !class.approval.is_approved() {
        return Err(EngineError::Inactive(class.id));
    }
    if class.participants >= class.capacity {
        return Err(EngineError::Full(class.id));
    }
    Ok(())
}

pub(crate) fn reserve(class: &mut ClassState, booking_id: Ulid) {
    class.participants += 1;
    class.roster.push(booking_id);
}

/// Give a seat back. Floors at zero; a booking not on the roster is a no-op.
pub(crate) fn release(class: &mut ClassState, booking_id: Ulid) {
    let Some(pos) = class.roster.iter().position(|id| *id == booking_id) else {
        return;
    };
    class.roster.remove(pos);
    class.participants = class.participants.saturating_sub(1);
}
