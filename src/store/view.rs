//! Read-time projections over a store snapshot.
//!
//! Nothing here is cached in the store; consumers recompute views from the
//! current collections whenever they render.

use crate::model::{Category, CategoryId, Item};

use super::{Collection, EntityStore};

/// Completion status filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Completed,
}

/// Client-side item filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemQuery {
    pub status: StatusFilter,
    pub category: Option<CategoryId>,
    /// Case-insensitive substring of the item name
    pub search: Option<String>,
}

impl ItemQuery {
    pub fn status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    pub fn category(mut self, category_id: impl Into<CategoryId>) -> Self {
        self.category = Some(category_id.into());
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }

    pub fn matches(&self, item: &Item) -> bool {
        if let Some(category) = self.category {
            if item.category_id != Some(category) {
                return false;
            }
        }

        match self.status {
            StatusFilter::Active if item.is_completed => return false,
            StatusFilter::Completed if !item.is_completed => return false,
            _ => {}
        }

        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => item
                .name
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        }
    }

    /// Matching items in store order
    pub fn apply<'a>(&self, store: &'a EntityStore) -> Vec<&'a Item> {
        store.items().iter().filter(|item| self.matches(item)).collect()
    }
}

/// Display color for an item.
///
/// Prefers the live category color, then the color denormalized onto the
/// item. Returns `None` when the item is uncategorized or its category no
/// longer exists.
pub fn resolve_category_color<'a>(
    item: &'a Item,
    categories: &'a Collection<Category>,
) -> Option<&'a str> {
    let category_id = item.category_id?;
    match categories.get(category_id) {
        Some(category) if !category.color.is_empty() => Some(category.color.as_str()),
        Some(_) => item.category_color.as_deref(),
        None => None,
    }
}

/// Name of the item's category, `None` for uncategorized or dangling.
pub fn category_name<'a>(item: &Item, categories: &'a Collection<Category>) -> Option<&'a str> {
    item.category_id
        .and_then(|id| categories.get(id))
        .map(|c| c.name.as_str())
}
