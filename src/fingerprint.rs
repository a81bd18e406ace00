use crate::core::Hash32;
use crate::data::DataCollection;
use crate::element::ElementId;

/// Cache key of one execution: which unit ran, with which settings, on which
/// inputs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    /// Pure function of its arguments; payload allocations never matter,
    /// only the identities the data carries.
    pub fn compute(element: ElementId, settings: Hash32, inputs: &DataCollection) -> Self {
        Fingerprint(Hash32::of(&(element.hash(), settings, inputs.content_hash())))
    }

    pub fn hash(&self) -> Hash32 {
        self.0
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
