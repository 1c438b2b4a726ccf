//! Consistency boundaries and the versions that guard them.

/// An aggregate: the only entry point for changing the entities it owns.
///
/// Whoever persists an aggregate stores `version()` next to it and refuses to
/// overwrite a row whose version moved since the aggregate was loaded.
pub trait AggregateRoot {
    type Id: Clone + Ord + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> &Self::Id;

    /// Version of the persisted state this instance was built from.
    fn version(&self) -> u64;
}

/// What a writer believes the stored version to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    /// No stored row is expected: the aggregate is new and gets inserted.
    Any,
    /// The row must still be at this version when the write lands.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a write made under this expectation may land on `stored`.
    pub fn matches(self, stored: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == stored,
        }
    }

    /// Version the row carries after the write succeeds.
    pub fn next(self) -> u64 {
        match self {
            ExpectedVersion::Any => 1,
            ExpectedVersion::Exact(v) => v + 1,
        }
    }
}
