//! Data flowing between tasks.
//!
//! A task consumes and produces a [`DataCollection`]: an immutable,
//! cheaply-clonable list of [`TaggedData`] items. Each item sits on an output
//! pin of the task that produced it and carries a content identity, so that
//! collections can be fingerprinted and compared without inspecting the
//! type-erased payloads.

use std::any::type_name;
use std::hash::Hash;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use crate::core::{ArcStr, Dynamic, Hash32};

/// Maximum number of pins a processing unit can expose on one side.
pub const MAX_PINS: u8 = 64;

/// A set of pin indices, one bit per pin.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PinMask(u64);

impl PinMask {
    pub const NONE: PinMask = PinMask(0);
    pub const ALL: PinMask = PinMask(u64::MAX);

    /// A mask holding a single pin.
    ///
    /// # Panics
    /// If `index` is not below [`MAX_PINS`].
    pub const fn pin(index: u8) -> Self {
        assert!(index < MAX_PINS, "pin index out of range");
        PinMask(1u64 << index)
    }

    pub const fn from_bits(bits: u64) -> Self {
        PinMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, index: u8) -> bool {
        index < MAX_PINS && self.0 & (1u64 << index) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every pin in `self` is also in `other`.
    pub const fn is_subset_of(self, other: PinMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn insert(&mut self, index: u8) {
        *self = *self | PinMask::pin(index);
    }
}

impl BitOr for PinMask {
    type Output = PinMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        PinMask(self.0 | rhs.0)
    }
}

impl BitAnd for PinMask {
    type Output = PinMask;

    fn bitand(self, rhs: Self) -> Self::Output {
        PinMask(self.0 & rhs.0)
    }
}

impl Not for PinMask {
    type Output = PinMask;

    fn not(self) -> Self::Output {
        PinMask(!self.0)
    }
}

impl std::fmt::Debug for PinMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PinMask({:#b})", self.0)
    }
}

/// A single piece of data on a pin.
#[derive(Clone)]
pub struct TaggedData {
    pin: u8,
    data: Dynamic,
    identity: Hash32,
    size: usize,
    tags: Vec<ArcStr>,
}

impl TaggedData {
    /// Wraps a value, deriving its identity from its type and its `Hash`
    /// implementation.
    pub fn new<T>(pin: u8, value: T) -> Self
    where
        T: Hash + Send + Sync + 'static,
    {
        let identity = Hash32::of(&(type_name::<T>(), &value));
        Self::with_identity(pin, value, identity)
    }

    /// Wraps a value whose identity is already known (for example a CRC kept
    /// alongside a large buffer).
    pub fn with_identity<T>(pin: u8, value: T, identity: Hash32) -> Self
    where
        T: Send + Sync + 'static,
    {
        debug_assert!(pin < MAX_PINS);

        Self {
            pin,
            data: Arc::new(value),
            identity,
            size: size_of::<T>(),
            tags: Vec::new(),
        }
    }

    /// Overrides the size hint used by the result cache's byte bound.
    pub fn with_size(mut self, bytes: usize) -> Self {
        self.size = bytes;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<ArcStr>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn identity(&self) -> Hash32 {
        self.identity
    }

    pub fn size_hint(&self) -> usize {
        self.size
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(AsRef::as_ref)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_ref() == tag)
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// True when both items share the same payload allocation.
    pub fn same_payload(&self, other: &TaggedData) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// The same payload, moved to another pin. Used when a producer's output
    /// becomes a consumer's input.
    pub(crate) fn on_pin(&self, pin: u8) -> Self {
        Self {
            pin,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for TaggedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedData")
            .field("pin", &self.pin)
            .field("identity", &self.identity)
            .field("tags", &self.tags)
            .finish()
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
struct Flags {
    cancelled: bool,
    failed: bool,
    needs_post_graph: bool,
}

/// The typed bundle of data a task consumes or produces.
///
/// Cloning is cheap: the items live behind a shared allocation, and two
/// consumers of the same output observe the very same items.
#[derive(Clone)]
pub struct DataCollection {
    items: Arc<[TaggedData]>,
    inactive_pins: PinMask,
    flags: Flags,
    failure: Option<ArcStr>,
}

impl Default for DataCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DataCollection {
    pub fn new(items: Vec<TaggedData>) -> Self {
        Self {
            items: Arc::from(items),
            inactive_pins: PinMask::NONE,
            flags: Flags::default(),
            failure: None,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The substitute result of a task that never ran to completion.
    pub fn cancelled() -> Self {
        let mut collection = Self::default();
        collection.flags.cancelled = true;
        collection
    }

    pub fn items(&self) -> &[TaggedData] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items sitting on the given pin.
    pub fn on_pin(&self, pin: u8) -> impl Iterator<Item = &TaggedData> {
        self.items.iter().filter(move |item| item.pin == pin)
    }

    /// Typed view of every item of type `T` on the given pin.
    pub fn values<T: 'static>(&self, pin: u8) -> impl Iterator<Item = &T> {
        self.on_pin(pin).filter_map(TaggedData::downcast_ref::<T>)
    }

    /// Output pins the producer reported as inactive.
    pub fn inactive_pins(&self) -> PinMask {
        self.inactive_pins
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled
    }

    /// Set when the producing element reported an error or panicked. The
    /// scheduler forwards this flag and does not interpret it.
    pub fn is_failed(&self) -> bool {
        self.flags.failed
    }

    /// The error or panic message of a failed producer.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn needs_post_graph_handling(&self) -> bool {
        self.flags.needs_post_graph
    }

    /// Sum of the size hints of all items.
    pub fn size_hint(&self) -> usize {
        self.items.iter().map(TaggedData::size_hint).sum()
    }

    /// Identity of the whole collection: every item's pin and identity, in
    /// order, together with the flags.
    pub fn content_hash(&self) -> Hash32 {
        let items: Vec<(u8, Hash32)> = self
            .items
            .iter()
            .map(|item| (item.pin, item.identity))
            .collect();

        Hash32::of(&(items, self.inactive_pins, self.flags))
    }

    /// True when both collections share the same item allocation.
    pub fn same_as(&self, other: &DataCollection) -> bool {
        Arc::ptr_eq(&self.items, &other.items)
    }

    pub(crate) fn with_inactive_pins(mut self, pins: PinMask) -> Self {
        self.inactive_pins = pins;
        self
    }

    pub(crate) fn into_failed(mut self, message: impl Into<ArcStr>) -> Self {
        self.flags.failed = true;
        self.failure = Some(message.into());
        self
    }

    pub(crate) fn with_post_graph_handling(mut self, needed: bool) -> Self {
        self.flags.needs_post_graph = needed;
        self
    }
}

impl std::fmt::Debug for DataCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCollection")
            .field("items", &self.items.len())
            .field("inactive_pins", &self.inactive_pins)
            .field("flags", &self.flags)
            .field("failure", &self.failure)
            .finish()
    }
}
