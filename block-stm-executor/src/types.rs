//! Core types for Block-STM execution.

use std::{collections::BTreeMap, fmt, sync::Arc};

/// Transaction index in the block (0-based).
pub type TxnIndex = u32;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = u32;

/// Validation wave, bumped every time a sweep of downstream revalidations is triggered.
pub type Wave = u32;

/// Keys are opaque byte strings ordered lexicographically.
pub type Key = Vec<u8>;

/// Sorted list of keys a transaction wrote in a single store.
pub type Locations = Vec<Key>;

/// Written locations of one transaction, keyed by store slot.
pub type MultiLocations = BTreeMap<usize, Locations>;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnVersion {
    pub index: TxnIndex,
    pub incarnation: Incarnation,
}

impl TxnVersion {
    pub fn new(index: TxnIndex, incarnation: Incarnation) -> Self {
        Self { index, incarnation }
    }
}

impl fmt::Display for TxnVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.index, self.incarnation)
    }
}

/// Values stored in a KV store.
///
/// The engine never needs to compare values: validation works on versions only.
/// Deletion is represented as `None` wherever a value may be absent.
pub trait StoreValue: Clone + Send + Sync + 'static {
    /// Approximate size of the value in bytes, summed into
    /// [`BlockSummary::written_bytes`](crate::BlockSummary::written_bytes).
    fn value_len(&self) -> usize;
}

impl StoreValue for Vec<u8> {
    fn value_len(&self) -> usize {
        self.len()
    }
}

/// Opaque value of an object store, with the length estimate supplied by the store.
#[derive(Clone)]
pub struct ObjectValue {
    inner: Arc<dyn std::any::Any + Send + Sync>,
    len: usize,
}

impl ObjectValue {
    pub fn new<T: std::any::Any + Send + Sync>(value: T, len: usize) -> Self {
        Self {
            inner: Arc::new(value),
            len,
        }
    }

    pub fn downcast_ref<T: std::any::Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectValue")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Value of a block that mixes byte-valued and object-valued stores.
#[derive(Debug, Clone)]
pub enum Value {
    Bytes(Vec<u8>),
    Object(ObjectValue),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Object(_) => None,
        }
    }

    pub fn as_object<T: std::any::Any>(&self) -> Option<&T> {
        match self {
            Value::Bytes(_) => None,
            Value::Object(object) => object.downcast_ref(),
        }
    }
}

impl StoreValue for Value {
    fn value_len(&self) -> usize {
        match self {
            Value::Bytes(bytes) => bytes.len(),
            Value::Object(object) => object.len,
        }
    }
}

/// Name of a declared KV store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Arc<str>);

impl StoreKey {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Dense slot numbering of the declared stores. The slot is the index used on every
/// hot path instead of the store key.
#[derive(Debug, Clone, Default)]
pub struct StoreSlots {
    keys: Vec<StoreKey>,
}

impl StoreSlots {
    pub fn new(keys: impl IntoIterator<Item = StoreKey>) -> Self {
        let mut slots = Self::default();
        for key in keys {
            if !slots.keys.contains(&key) {
                slots.keys.push(key);
            }
        }
        slots
    }

    pub fn slot(&self, key: &StoreKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn key(&self, slot: usize) -> &StoreKey {
        &self.keys[slot]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &StoreKey)> {
        self.keys.iter().enumerate()
    }
}

/// Range and direction of an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Inclusive lower bound, `None` for unbounded.
    pub start: Option<Key>,
    /// Exclusive upper bound, `None` for unbounded.
    pub end: Option<Key>,
    pub ascending: bool,
}

impl IteratorOptions {
    pub fn new(start: Option<&[u8]>, end: Option<&[u8]>, ascending: bool) -> Self {
        Self {
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            ascending,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |start| key >= start)
            && self.end.as_deref().map_or(true, |end| key < end)
    }
}

/// Whether `key` lies strictly beyond `bound` in the iteration direction.
pub fn key_beyond(key: &[u8], bound: &[u8], ascending: bool) -> bool {
    if ascending {
        key > bound
    } else {
        key < bound
    }
}

/// A point read: `None` version means the value came from base storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDescriptor {
    pub key: Key,
    pub version: Option<TxnVersion>,
}

/// A recorded iteration, replayed during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IteratorDescriptor {
    pub options: IteratorOptions,
    /// Last key observed by the caller if it stopped before the iterator was exhausted.
    pub stop: Option<Key>,
    /// Multi-version entries produced by the iteration, in iteration order.
    pub reads: Vec<ReadDescriptor>,
}

/// Reads captured by one incarnation in one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    pub reads: Vec<ReadDescriptor>,
    pub iterators: Vec<IteratorDescriptor>,
}

impl ReadSet {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.iterators.is_empty()
    }
}

/// Read-sets of one incarnation, keyed by store slot.
pub type MultiReadSet = BTreeMap<usize, ReadSet>;
