//! Id-keyed, order-preserving entity collection.
//!
//! Both mirrored collections share this type so that items and categories go
//! through exactly the same insert/replace/remove semantics.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::model::{Category, CategoryId, Item, ItemId};

/// An entity with a stable server-assigned identifier
pub trait Entity: Clone {
    type Id: Copy + Eq + Hash + fmt::Debug + fmt::Display;

    /// Short name used in log output
    const KIND: &'static str;

    fn id(&self) -> Self::Id;
}

impl Entity for Item {
    type Id = ItemId;
    const KIND: &'static str = "item";

    fn id(&self) -> ItemId {
        self.id
    }
}

impl Entity for Category {
    type Id = CategoryId;
    const KIND: &'static str = "category";

    fn id(&self) -> CategoryId {
        self.id
    }
}

/// Outcome of [`Collection::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The id was new and the entity was appended
    Inserted,
    /// The id already existed and its entry was overwritten in place
    Replaced,
}

/// Entities in server order with an id index for point updates.
///
/// Holds at most one entry per id.
#[derive(Debug, Clone)]
pub struct Collection<T: Entity> {
    entries: Vec<T>,
    index: HashMap<T::Id, usize>,
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Entity> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: T::Id) -> Option<&T> {
        self.index.get(&id).map(|&pos| &self.entries[pos])
    }

    pub fn contains(&self, id: T::Id) -> bool {
        self.index.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<T::Id> {
        self.entries.iter().map(|e| e.id()).collect()
    }

    /// Add an entity, or overwrite the existing entry with the same id.
    pub fn insert(&mut self, entity: T) -> Upsert {
        match self.index.get(&entity.id()) {
            Some(&pos) => {
                self.entries[pos] = entity;
                Upsert::Replaced
            }
            None => {
                self.index.insert(entity.id(), self.entries.len());
                self.entries.push(entity);
                Upsert::Inserted
            }
        }
    }

    /// Overwrite the entry with the same id. Absent ids are ignored.
    pub fn replace(&mut self, entity: T) -> bool {
        match self.index.get(&entity.id()) {
            Some(&pos) => {
                self.entries[pos] = entity;
                true
            }
            None => false,
        }
    }

    pub fn remove_by_id(&mut self, id: T::Id) -> bool {
        if !self.index.contains_key(&id) {
            return false;
        }
        self.entries.retain(|e| e.id() != id);
        self.reindex();
        true
    }

    /// Remove every listed id in one pass. Returns how many entries went away.
    pub fn remove_many(&mut self, ids: &[T::Id]) -> usize {
        let targets: HashSet<T::Id> = ids.iter().copied().collect();
        self.retain(|e| !targets.contains(&e.id()))
    }

    /// Keep only the entries matching `keep`. Returns how many were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    /// Mutate the entry with `id` in place. Absent ids are ignored.
    pub fn patch(&mut self, id: T::Id, f: impl FnOnce(&mut T)) -> bool {
        match self.index.get(&id) {
            Some(&pos) => {
                f(&mut self.entries[pos]);
                true
            }
            None => false,
        }
    }

    /// Mutate every listed entry in one pass. Returns how many were touched.
    pub fn patch_many(&mut self, ids: &[T::Id], mut f: impl FnMut(&mut T)) -> usize {
        let targets: HashSet<T::Id> = ids.iter().copied().collect();
        let mut touched = 0;
        for entry in self.entries.iter_mut() {
            if targets.contains(&entry.id()) {
                f(entry);
                touched += 1;
            }
        }
        touched
    }

    /// Swap in a freshly listed collection. Duplicate ids collapse onto the
    /// first position with the last value.
    pub fn replace_all(&mut self, entities: Vec<T>) {
        self.entries.clear();
        self.index.clear();
        for entity in entities {
            self.insert(entity);
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id(), pos))
            .collect();
    }
}
