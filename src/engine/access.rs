use crate::model::{CallerId, Reservation};

use super::EngineError;

/// A reservation is visible to, and changeable by, its owner only. There is
/// no privileged role that bypasses this.
pub fn can_access(caller: &CallerId, reservation: &Reservation) -> bool {
    reservation.owner == *caller
}

pub(super) fn authorize(caller: &CallerId, reservation: &Reservation) -> Result<(), EngineError> {
    if can_access(caller, reservation) {
        Ok(())
    } else {
        tracing::debug!(%caller, booking_id = %reservation.id, "access denied");
        Err(EngineError::Forbidden(reservation.id))
    }
}
