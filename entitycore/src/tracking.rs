//! Change-tracking states for entities inside one transaction.
//!
//! Every entity reachable from a transaction's identity map carries exactly
//! one tracking state. The transition table lives here so the store only
//! has to interpret [`Transition`] values; the table itself is total and
//! unit-tested exhaustively.

/// The tracking state of one entity within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// Loaded (or otherwise known) but with no recorded change.
    Untracked,
    /// Newly created in this transaction; nothing committed yet.
    Created,
    /// Exists in the log and has recorded changes.
    Updated,
    /// Pending deletion; a terminal event is appended on save.
    Deleted,
}

/// Outcome of applying a tracking operation to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    Set(TrackingState),
    /// Stay in the current state; the operation is idempotent here.
    Noop,
    /// Drop tracking for the entity entirely (removing an uncommitted
    /// creation leaves nothing to roll back).
    Forget,
    /// The operation is a programmer error in this state.
    Illegal,
}

impl TrackingState {
    /// Transition for an `add` of the entity.
    ///
    /// Adding an already-updated entity is illegal so a deleted entity
    /// cannot be accidentally resurrected as new; re-adding a deleted
    /// entity before commit treats it as an update, since it still exists
    /// in the log.
    pub fn on_add(self) -> Transition {
        match self {
            Self::Untracked => Transition::Set(Self::Created),
            Self::Created => Transition::Noop,
            Self::Updated => Transition::Illegal,
            Self::Deleted => Transition::Set(Self::Updated),
        }
    }

    /// Transition for an `update` of the entity.
    pub fn on_update(self) -> Transition {
        match self {
            Self::Untracked => Transition::Set(Self::Updated),
            Self::Created | Self::Updated => Transition::Noop,
            Self::Deleted => Transition::Illegal,
        }
    }

    /// Transition for a `remove` of the entity.
    pub fn on_remove(self) -> Transition {
        match self {
            Self::Untracked | Self::Updated => Transition::Set(Self::Deleted),
            Self::Created => Transition::Forget,
            Self::Deleted => Transition::Noop,
        }
    }

    /// Whether this state contributes events to a save.
    pub fn is_dirty(self) -> bool {
        !matches!(self, Self::Untracked)
    }
}
