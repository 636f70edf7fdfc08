//! Typed result handles and the merge rules that fill them.
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

/// A result slot returned by a query call before its data exists.
///
/// The slot is written at most once, by the completion of the task that
/// produced it, and only if that task succeeded. After a successful
/// [`join_all`](crate::Session::join_all) every handle of the batch is
/// populated. After a failed or aborted join no handle of that batch should be
/// trusted: tasks that failed, were cancelled, or had not been observed yet
/// leave their handles empty.
pub struct Handle<T> {
    slot: Arc<OnceLock<T>>,
}

impl<T> Handle<T> {
    pub(crate) fn new() -> (Self, Slot<T>) {
        let slot = Arc::new(OnceLock::new());
        let writer = Slot(Arc::clone(&slot));
        (Self { slot }, writer)
    }

    /// The merged value, if the producing task has completed successfully.
    pub fn get(&self) -> Option<&T> {
        self.slot.get()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Takes the merged value out of the handle.
    ///
    /// Returns `None` when the handle was never populated, and also while a
    /// cancelled producer of an aborted batch is still winding down.
    pub fn into_inner(self) -> Option<T> {
        Arc::try_unwrap(self.slot).ok().and_then(OnceLock::into_inner)
    }

    /// Like [`into_inner`](Self::into_inner), with an empty container in
    /// place of a missing value.
    pub fn unwrap_or_default(self) -> T
    where
        T: Default,
    {
        self.into_inner().unwrap_or_default()
    }
}

impl<T: Clone> Handle<T> {
    pub fn cloned(&self) -> Option<T> {
        self.get().cloned()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot.get() {
            Some(value) => f.debug_tuple("Handle").field(value).finish(),
            None => write!(f, "Handle(<pending>)"),
        }
    }
}

/// The writing side of a [`Handle`], owned by exactly one task.
pub(crate) struct Slot<T>(Arc<OnceLock<T>>);

impl<T> Slot<T> {
    /// Consumes the writer, so the task drops its reference to the handle as
    /// soon as the value is stored.
    pub(crate) fn fill(self, value: T) {
        // The only writer is consumed here, the slot cannot be occupied yet.
        let _ = self.0.set(value);
    }
}

/// A merge rule: turns a producer's output into the value stored in the
/// handle, starting from an empty container of the handle's shape.
pub(crate) trait Sink<I>: Send + 'static {
    type Output: Send + Sync + 'static;

    fn merge(self, input: I) -> Self::Output;
}

/// Stores the produced value as is.
pub(crate) struct Single;

impl<V> Sink<V> for Single
where
    V: Send + Sync + 'static,
{
    type Output = V;

    fn merge(self, input: V) -> V {
        input
    }
}

/// Extends an empty collection with every produced element, preserving the
/// producer's order for ordered collections and collapsing duplicates for
/// sets.
pub(crate) struct Collect<C>(PhantomData<fn() -> C>);

impl<C> Collect<C> {
    pub(crate) fn new() -> Self {
        Self(PhantomData)
    }
}

impl<I, C> Sink<I> for Collect<C>
where
    I: IntoIterator,
    C: Default + Extend<I::Item> + Send + Sync + 'static,
{
    type Output = C;

    fn merge(self, input: I) -> C {
        let mut acc = C::default();
        acc.extend(input);
        acc
    }
}

pub(crate) type ListSink<V> = Collect<Vec<V>>;
pub(crate) type SetSink<V> = Collect<HashSet<V>>;
pub(crate) type EntriesSink<K, V> = Collect<HashMap<K, V>>;

/// Indexes every element by a derived key; on collision the later element
/// wins.
pub(crate) struct KeyBy<F>(pub(crate) F);

impl<I, K, V, F> Sink<I> for KeyBy<F>
where
    I: IntoIterator<Item = V>,
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&V) -> K + Send + 'static,
{
    type Output = HashMap<K, V>;

    fn merge(self, input: I) -> HashMap<K, V> {
        let mut acc = HashMap::new();
        for item in input {
            acc.insert((self.0)(&item), item);
        }
        acc
    }
}

/// Groups elements under a derived key, keeping the producer's order within
/// each group.
pub(crate) struct GroupBy<F>(pub(crate) F);

impl<I, K, V, F> Sink<I> for GroupBy<F>
where
    I: IntoIterator<Item = V>,
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&V) -> K + Send + 'static,
{
    type Output = HashMap<K, Vec<V>>;

    fn merge(self, input: I) -> HashMap<K, Vec<V>> {
        let mut acc: HashMap<K, Vec<V>> = HashMap::new();
        for item in input {
            acc.entry((self.0)(&item)).or_default().push(item);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Row {
        id: u32,
        cat: &'static str,
    }

    fn rows() -> Vec<Row> {
        vec![
            Row { id: 1, cat: "x" },
            Row { id: 2, cat: "x" },
            Row { id: 3, cat: "y" },
        ]
    }

    #[test]
    fn test_handle_lifecycle() {
        let (handle, slot) = Handle::<u32>::new();
        assert!(!handle.is_ready());
        assert_eq!(format!("{handle:?}"), "Handle(<pending>)");

        slot.fill(7);

        assert_eq!(handle.get(), Some(&7));
        assert_eq!(handle.cloned(), Some(7));
        assert_eq!(handle.into_inner(), Some(7));
    }

    #[test]
    fn test_unfilled_handle_defaults() {
        let (handle, slot) = Handle::<Vec<u32>>::new();
        drop(slot);

        assert_eq!(handle.get(), None);
        assert_eq!(handle.unwrap_or_default(), Vec::<u32>::new());
    }

    #[test]
    fn test_list_keeps_producer_order() {
        let list: Vec<u32> = ListSink::new().merge(vec![3, 1, 2]);
        assert_eq!(list, vec![3, 1, 2]);
    }

    #[test]
    fn test_set_collapses_duplicates() {
        let set: HashSet<u32> = SetSink::new().merge(vec![1, 1, 2]);
        assert_eq!(set, HashSet::from([1, 2]));
    }

    #[test]
    fn test_key_by_last_write_wins() {
        let map = KeyBy(|row: &Row| row.cat).merge(rows());

        assert_eq!(map.len(), 2);
        assert_eq!(map["x"].id, 2);
        assert_eq!(map["y"].id, 3);
    }

    #[test]
    fn test_group_by_accumulates() {
        let groups = GroupBy(|row: &Row| row.cat).merge(rows());

        assert_eq!(groups["x"], rows()[..2].to_vec());
        assert_eq!(groups["y"], vec![Row { id: 3, cat: "y" }]);
    }

    #[test]
    fn test_entries_copied_from_ready_map() {
        let source = BTreeMap::from([("a", 1), ("b", 2)]);
        let map: HashMap<&str, i32> = EntriesSink::new().merge(source);

        assert_eq!(map, HashMap::from([("a", 1), ("b", 2)]));
    }
}
