use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Links<K> {
    prev: Option<K>,
    next: Option<K>,
}

/// Ordered set of underwriters eligible for new short exposure.
///
/// Doubly linked through an index map: O(1) push to the tail, O(1)
/// removal by key, and O(1) stepping from any key to its successor. A key
/// is present at most once.
#[derive(Debug, Clone)]
pub struct UnderwriterQueue<K> {
    links: HashMap<K, Links<K>>,
    head: Option<K>,
    tail: Option<K>,
}

impl<K: Clone + Eq + Hash> Default for UnderwriterQueue<K> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<K: Clone + Eq + Hash> UnderwriterQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn front(&self) -> Option<&K> {
        self.head.as_ref()
    }

    /// Appends `key`. Returns false if it was already queued.
    pub fn push_back(&mut self, key: K) -> bool {
        if self.links.contains_key(&key) {
            return false;
        }
        let prev = self.tail.replace(key.clone());
        match &prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(p) {
                    l.next = Some(key.clone());
                }
            }
            None => self.head = Some(key.clone()),
        }
        self.links.insert(key, Links { prev, next: None });
        true
    }

    /// Unlinks `key`. Returns false if it was not queued.
    pub fn remove(&mut self, key: &K) -> bool {
        let Some(Links { prev, next }) = self.links.remove(key) else {
            return false;
        };
        match &prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(p) {
                    l.next = next.clone();
                }
            }
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(n) {
                    l.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        true
    }

    /// Successor of `key`, `None` at the tail or when `key` is not queued.
    #[inline]
    pub fn next_after(&self, key: &K) -> Option<&K> {
        self.links.get(key).and_then(|l| l.next.as_ref())
    }

    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            queue: self,
            cursor: self.head.as_ref(),
        }
    }
}

pub struct Iter<'a, K> {
    queue: &'a UnderwriterQueue<K>,
    cursor: Option<&'a K>,
}

impl<'a, K: Clone + Eq + Hash> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<&'a K> {
        let current = self.cursor?;
        self.cursor = self.queue.next_after(current);
        Some(current)
    }
}
