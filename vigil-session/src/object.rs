use std::any::Any;
use std::collections::HashMap;

/// A per-session field object, keyed inside the store by a caller-defined
/// fingerprint/equality pair. The fingerprint is a content hash; equality
/// settles fingerprint collisions.
pub trait SessionObject: Any {
    fn fingerprint(&self) -> u32;
    fn equals(&self, other: &dyn SessionObject) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Holds the opaque objects attached to a session's object fields, with a
/// byte budget for admission. Eviction is not this store's job; it only
/// does bookkeeping and lookup.
pub struct ObjectStore {
    budget: usize,
    used: usize,
    buckets: HashMap<u16, Vec<Box<dyn SessionObject>>>,
}

impl ObjectStore {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            buckets: HashMap::new(),
        }
    }

    /// Looks up an object equal to `probe` and hands back a typed mutable
    /// reference so the caller can merge into it.
    pub fn find_mut<T: SessionObject>(&mut self, pos: u16, probe: &T) -> Option<&mut T> {
        let fingerprint = probe.fingerprint();
        let items = self.buckets.get_mut(&pos)?;
        items
            .iter_mut()
            .find(|item| item.fingerprint() == fingerprint && item.equals(probe))
            .and_then(|item| item.as_any_mut().downcast_mut::<T>())
    }

    /// Admits `object` if the budget allows it. An object equal to one
    /// already stored is reported admitted and the duplicate is dropped;
    /// callers that need the stored one use [`ObjectStore::find_mut`].
    pub fn add(&mut self, pos: u16, object: Box<dyn SessionObject>, size_hint: usize) -> bool {
        let items = self.buckets.entry(pos).or_default();
        let fingerprint = object.fingerprint();
        if items
            .iter()
            .any(|item| item.fingerprint() == fingerprint && item.equals(object.as_ref()))
        {
            return true;
        }
        if self.used + size_hint > self.budget {
            tracing::debug!("object store refused {size_hint} bytes at field {pos}");
            return false;
        }
        self.used += size_hint;
        items.push(object);
        true
    }

    /// Accounts growth of an already-admitted object. Never refuses; the
    /// object owns its storage either way.
    pub fn charge(&mut self, size: usize) {
        self.used += size;
    }

    pub fn iter(&self, pos: u16) -> impl Iterator<Item = &dyn SessionObject> {
        self.buckets
            .get(&pos)
            .into_iter()
            .flatten()
            .map(|item| item.as_ref())
    }

    pub fn count(&self, pos: u16) -> usize {
        self.buckets.get(&pos).map(|items| items.len()).unwrap_or(0)
    }

    pub fn used(&self) -> usize {
        self.used
    }
}
