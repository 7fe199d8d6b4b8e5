//! In-memory mirror of the server's items and categories.
//!
//! The store only changes through apply-functions, and every apply-function
//! is idempotent: applying the same update twice leaves the same state as
//! applying it once. Both the command layer and the hub event routing feed the
//! store through [`StoreUpdate`], so neither channel can shape the mirror
//! differently from the other.

mod collection;
pub mod view;

pub use collection::{Collection, Entity, Upsert};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::model::{Category, CategoryId, Item, ItemId, Priority};

/// Capacity of the change feed before slow observers start lagging
const CHANGE_FEED_CAPACITY: usize = 256;

/// A single mutation of the mirror, independent of the channel that caused it
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// Full item listing (rehydration)
    ItemsLoaded(Vec<Item>),
    /// Item created; replaces an existing entry with the same id
    ItemUpserted(Item),
    /// Item updated; ignored if the id is unknown
    ItemReplaced(Item),
    ItemRemoved(ItemId),
    ItemCompleted(ItemId),
    ItemLoopSet { id: ItemId, looped: bool },
    /// Relative flip, only used when the wire carries nothing but an id
    ItemLoopToggled(ItemId),
    ItemPrioritySet { id: ItemId, priority: Priority },
    ItemsRemoved(Vec<ItemId>),
    ItemsCompleted(Vec<ItemId>),
    /// Full category listing (rehydration)
    CategoriesLoaded(Vec<Category>),
    CategoryUpserted(Category),
    CategoryReplaced(Category),
    CategoryRemoved(CategoryId),
    /// Category removed together with every item that references it
    CategoryRemovedWithItems(CategoryId),
    /// Session ended; both collections emptied
    Cleared,
}

impl StoreUpdate {
    /// Short label for log output
    pub fn kind(&self) -> &'static str {
        match self {
            StoreUpdate::ItemsLoaded(_) => "items_loaded",
            StoreUpdate::ItemUpserted(_) => "item_upserted",
            StoreUpdate::ItemReplaced(_) => "item_replaced",
            StoreUpdate::ItemRemoved(_) => "item_removed",
            StoreUpdate::ItemCompleted(_) => "item_completed",
            StoreUpdate::ItemLoopSet { .. } => "item_loop_set",
            StoreUpdate::ItemLoopToggled(_) => "item_loop_toggled",
            StoreUpdate::ItemPrioritySet { .. } => "item_priority_set",
            StoreUpdate::ItemsRemoved(_) => "items_removed",
            StoreUpdate::ItemsCompleted(_) => "items_completed",
            StoreUpdate::CategoriesLoaded(_) => "categories_loaded",
            StoreUpdate::CategoryUpserted(_) => "category_upserted",
            StoreUpdate::CategoryReplaced(_) => "category_replaced",
            StoreUpdate::CategoryRemoved(_) => "category_removed",
            StoreUpdate::CategoryRemovedWithItems(_) => "category_removed_with_items",
            StoreUpdate::Cleared => "cleared",
        }
    }
}

/// The two mirrored collections
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    items: Collection<Item>,
    categories: Collection<Category>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &Collection<Item> {
        &self.items
    }

    pub fn categories(&self) -> &Collection<Category> {
        &self.categories
    }

    // ------------------------------------------------------------------
    // Item apply-functions
    // ------------------------------------------------------------------

    pub fn insert_item(&mut self, item: Item) -> Upsert {
        self.items.insert(item)
    }

    pub fn replace_item(&mut self, item: Item) -> bool {
        self.items.replace(item)
    }

    pub fn remove_item(&mut self, id: ItemId) -> bool {
        self.items.remove_by_id(id)
    }

    pub fn set_completed(&mut self, id: ItemId) -> bool {
        self.items.patch(id, |item| item.is_completed = true)
    }

    pub fn set_looped(&mut self, id: ItemId, looped: bool) -> bool {
        self.items.patch(id, |item| item.is_looped = looped)
    }

    pub fn toggle_looped(&mut self, id: ItemId) -> bool {
        self.items.patch(id, |item| item.is_looped = !item.is_looped)
    }

    pub fn set_priority(&mut self, id: ItemId, priority: Priority) -> bool {
        self.items.patch(id, |item| item.priority = priority)
    }

    pub fn remove_items(&mut self, ids: &[ItemId]) -> usize {
        self.items.remove_many(ids)
    }

    pub fn complete_items(&mut self, ids: &[ItemId]) -> usize {
        self.items.patch_many(ids, |item| item.is_completed = true)
    }

    pub fn replace_items(&mut self, items: Vec<Item>) {
        self.items.replace_all(items)
    }

    pub fn remove_items_in_category(&mut self, category_id: CategoryId) -> usize {
        self.items.retain(|item| item.category_id != Some(category_id))
    }

    // ------------------------------------------------------------------
    // Category apply-functions
    // ------------------------------------------------------------------

    pub fn insert_category(&mut self, category: Category) -> Upsert {
        self.categories.insert(category)
    }

    pub fn replace_category(&mut self, category: Category) -> bool {
        self.categories.replace(category)
    }

    /// Items that reference the category keep their (now dangling) id.
    pub fn remove_category(&mut self, id: CategoryId) -> bool {
        self.categories.remove_by_id(id)
    }

    pub fn replace_categories(&mut self, categories: Vec<Category>) {
        self.categories.replace_all(categories)
    }

    /// Drop everything. Returns whether anything was held.
    pub fn clear(&mut self) -> bool {
        let held = !self.items.is_empty() || !self.categories.is_empty();
        *self = Self::default();
        held
    }

    /// Apply one tagged update. Returns whether anything in the store matched.
    pub fn apply(&mut self, update: StoreUpdate) -> bool {
        match update {
            StoreUpdate::ItemsLoaded(items) => {
                self.replace_items(items);
                true
            }
            StoreUpdate::ItemUpserted(item) => {
                self.insert_item(item);
                true
            }
            StoreUpdate::ItemReplaced(item) => self.replace_item(item),
            StoreUpdate::ItemRemoved(id) => self.remove_item(id),
            StoreUpdate::ItemCompleted(id) => self.set_completed(id),
            StoreUpdate::ItemLoopSet { id, looped } => self.set_looped(id, looped),
            StoreUpdate::ItemLoopToggled(id) => self.toggle_looped(id),
            StoreUpdate::ItemPrioritySet { id, priority } => self.set_priority(id, priority),
            StoreUpdate::ItemsRemoved(ids) => self.remove_items(&ids) > 0,
            StoreUpdate::ItemsCompleted(ids) => self.complete_items(&ids) > 0,
            StoreUpdate::CategoriesLoaded(categories) => {
                self.replace_categories(categories);
                true
            }
            StoreUpdate::CategoryUpserted(category) => {
                self.insert_category(category);
                true
            }
            StoreUpdate::CategoryReplaced(category) => self.replace_category(category),
            StoreUpdate::CategoryRemoved(id) => self.remove_category(id),
            StoreUpdate::CategoryRemovedWithItems(id) => {
                let removed_items = self.remove_items_in_category(id);
                self.remove_category(id) || removed_items > 0
            }
            StoreUpdate::Cleared => self.clear(),
        }
    }
}

/// A change that went through [`SharedStore::apply`]
#[derive(Debug, Clone)]
pub struct StoreChange {
    /// Monotonic counter, bumped once per matching update
    pub revision: u64,
    pub update: StoreUpdate,
}

/// Shared handle to the mirror.
///
/// Each apply holds the write lock for exactly one update, so updates from
/// the two channels never interleave. Observers get matching updates through
/// a broadcast feed, in revision order.
///
/// Loop toggles acknowledged by the command layer are remembered per item
/// until the hub reports them, so a bare-id toggle event resolves to the
/// acknowledged flag instead of flipping it a second time.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<RwLock<EntityStore>>,
    revision: Arc<AtomicU64>,
    changes: broadcast::Sender<StoreChange>,
    loop_expectations: Arc<DashMap<ItemId, bool>>,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(EntityStore::new())),
            revision: Arc::new(AtomicU64::new(0)),
            changes,
            loop_expectations: Arc::new(DashMap::new()),
        }
    }

    /// Apply an update. Updates that match nothing leave the revision alone
    /// and are not broadcast.
    pub fn apply(&self, update: StoreUpdate) -> bool {
        self.commit(update, false)
    }

    /// Apply an update that arrived as a hub event.
    ///
    /// Any loop event for an item settles an outstanding toggle on it; a bare
    /// toggle becomes the flag that toggle was expected to produce.
    pub fn apply_event(&self, update: StoreUpdate) -> bool {
        self.commit(update, true)
    }

    /// Remember the flag an in-flight loop toggle is expected to produce
    pub fn expect_loop(&self, id: ItemId, looped: bool) {
        self.loop_expectations.insert(id, looped);
    }

    /// Correct an outstanding expectation with the acknowledged flag. No-op
    /// when the hub already settled it.
    pub fn settle_loop(&self, id: ItemId, looped: bool) {
        if let Some(mut expected) = self.loop_expectations.get_mut(&id) {
            *expected = looped;
        }
    }

    pub fn forget_loop(&self, id: ItemId) {
        self.loop_expectations.remove(&id);
    }

    fn commit(&self, update: StoreUpdate, from_hub: bool) -> bool {
        let mut store = self.inner.write();

        let update = match update {
            StoreUpdate::ItemLoopToggled(id) if from_hub => {
                match self.loop_expectations.remove(&id) {
                    Some((_, looped)) => StoreUpdate::ItemLoopSet { id, looped },
                    None => StoreUpdate::ItemLoopToggled(id),
                }
            }
            StoreUpdate::ItemLoopSet { id, looped } if from_hub => {
                self.loop_expectations.remove(&id);
                StoreUpdate::ItemLoopSet { id, looped }
            }
            StoreUpdate::ItemsLoaded(items) => {
                self.loop_expectations.clear();
                StoreUpdate::ItemsLoaded(items)
            }
            StoreUpdate::Cleared => {
                self.loop_expectations.clear();
                StoreUpdate::Cleared
            }
            other => other,
        };

        let kind = update.kind();
        if !store.apply(update.clone()) {
            trace!(update = kind, "store update matched nothing");
            return false;
        }

        // Published under the lock so observers see revisions in order
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(update = kind, revision, "store updated");
        let _ = self.changes.send(StoreChange { revision, update });
        drop(store);
        true
    }

    /// Run `f` against the current state under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&EntityStore) -> R) -> R {
        f(&self.inner.read())
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> EntityStore {
        self.inner.read().clone()
    }

    pub fn item(&self, id: ItemId) -> Option<Item> {
        self.read(|s| s.items().get(id).cloned())
    }

    pub fn category(&self, id: CategoryId) -> Option<Category> {
        self.read(|s| s.categories().get(id).cloned())
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Subscribe to matching updates
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
