//! Core identifier and revision types.
//!
//! All types use smart constructors so that a value, once built, is valid
//! everywhere it travels - "parse, don't validate".

use nutype::nutype;
use uuid::Uuid;

/// Identifies one logical entity's event history.
///
/// One stream maps to one entity instance over time. `StreamId` values are
/// guaranteed non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct StreamId(String);

/// A globally unique event identifier in UUIDv7 format.
///
/// UUIDv7 carries a timestamp component, so ids sort in creation order,
/// which keeps appended events stably ordered across adapters.
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new `EventId` stamped with the current time.
    pub fn new() -> Self {
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Commit token: how many events have been durably appended to a stream.
///
/// `StreamRevision::initial()` (zero) means the stream has no committed
/// events yet. Revisions are totally ordered by append and only ever move
/// forward through successful commits.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct StreamRevision(u64);

impl StreamRevision {
    /// The revision of a stream with no committed events.
    pub fn initial() -> Self {
        Self::try_new(0).expect("0 is always a valid revision")
    }

    /// Returns the revision after one more committed event.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::try_new(current + 1).expect("next revision should always be valid")
    }

    /// Whether this is the no-committed-events revision.
    pub fn is_initial(self) -> bool {
        let current: u64 = self.into();
        current == 0
    }
}

impl Default for StreamRevision {
    fn default() -> Self {
        Self::initial()
    }
}
