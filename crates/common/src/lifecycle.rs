//! Notification status state machine.
//!
//! Every status change is a compare-and-swap against the stored `version`: the
//! caller states the version it last read, and the change only applies if the
//! record still carries that version. Repositories call [`transition`] (in memory)
//! or encode the same rule in a conditional `UPDATE` using [`predecessors`].

use thiserror::Error;

use crate::types::NotificationStatus;

/// Why a status transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i32, actual: i32 },

    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: NotificationStatus,
        to: NotificationStatus,
    },
}

/// Statuses a record may move to `desired` from.
pub fn predecessors(desired: NotificationStatus) -> &'static [NotificationStatus] {
    use NotificationStatus::*;
    match desired {
        Prepare => &[],
        Pending => &[Prepare],
        Sending => &[Prepare, Pending, Failed],
        Canceled => &[Prepare, Pending],
        Succeeded | Failed => &[Sending],
    }
}

pub fn can_transition(from: NotificationStatus, to: NotificationStatus) -> bool {
    predecessors(to).contains(&from)
}

/// Apply a version-checked transition and return the new version.
pub fn transition(
    current: NotificationStatus,
    current_version: i32,
    desired: NotificationStatus,
    expected_version: i32,
) -> Result<i32, TransitionError> {
    if current_version != expected_version {
        return Err(TransitionError::VersionConflict {
            expected: expected_version,
            actual: current_version,
        });
    }
    if !can_transition(current, desired) {
        return Err(TransitionError::Illegal {
            from: current,
            to: desired,
        });
    }
    Ok(current_version + 1)
}
