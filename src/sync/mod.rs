//! Push event routing into the entity store.
//!
//! This module maps hub events onto store updates. It provides:
//! - The fixed set of entity change events the server emits
//! - A pure routing function from event arguments to a [`StoreUpdate`]
//! - The coordinator that binds the routing to a session's push connection

mod coordinator;

pub use coordinator::SyncCoordinator;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::model::{Category, CategoryId, Item, ItemId, Priority};
use crate::store::StoreUpdate;

/// Entity change events, by canonical (camelCase) name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ItemCreated,
    ItemUpdated,
    ItemDeleted,
    ItemCompleted,
    ItemLoopToggled,
    ItemPriorityUpdated,
    CategoryCreated,
    CategoryUpdated,
    CategoryDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ItemCreated,
        EventKind::ItemUpdated,
        EventKind::ItemDeleted,
        EventKind::ItemCompleted,
        EventKind::ItemLoopToggled,
        EventKind::ItemPriorityUpdated,
        EventKind::CategoryCreated,
        EventKind::CategoryUpdated,
        EventKind::CategoryDeleted,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::ItemCreated => "itemCreated",
            EventKind::ItemUpdated => "itemUpdated",
            EventKind::ItemDeleted => "itemDeleted",
            EventKind::ItemCompleted => "itemCompleted",
            EventKind::ItemLoopToggled => "itemLoopToggled",
            EventKind::ItemPriorityUpdated => "itemPriorityUpdated",
            EventKind::CategoryCreated => "categoryCreated",
            EventKind::CategoryUpdated => "categoryUpdated",
            EventKind::CategoryDeleted => "categoryDeleted",
        }
    }

    /// Look up by canonical name (case-exact)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an event payload could not be routed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("{0} event carried no payload")]
    MissingPayload(EventKind),

    #[error("{event} event has no usable id in {payload}")]
    InvalidId { event: EventKind, payload: String },

    #[error("{event} event payload is malformed: {message}")]
    InvalidPayload { event: EventKind, message: String },
}

/// Turn one event's arguments into the store update it stands for.
///
/// Entity events carry the full entity; delete/complete events carry the id
/// (a number, a numeric string or an object with `id`). Priority updates carry
/// `{id, priority}` or the pair as two arguments. Loop events carrying
/// `isLooped` set the flag; a bare id flips it.
pub fn route(event: EventKind, arguments: &[Value]) -> Result<StoreUpdate, RouteError> {
    let payload = arguments.first().ok_or(RouteError::MissingPayload(event))?;

    let update = match event {
        EventKind::ItemCreated => StoreUpdate::ItemUpserted(entity::<Item>(event, payload)?),
        EventKind::ItemUpdated => StoreUpdate::ItemReplaced(entity::<Item>(event, payload)?),
        EventKind::ItemDeleted => StoreUpdate::ItemRemoved(ItemId(id_of(event, payload)?)),
        EventKind::ItemCompleted => StoreUpdate::ItemCompleted(ItemId(id_of(event, payload)?)),
        EventKind::ItemLoopToggled => {
            let id = ItemId(id_of(event, payload)?);
            match payload.get("isLooped").and_then(Value::as_bool) {
                Some(looped) => StoreUpdate::ItemLoopSet { id, looped },
                None => StoreUpdate::ItemLoopToggled(id),
            }
        }
        EventKind::ItemPriorityUpdated => {
            let id = ItemId(id_of(event, payload)?);
            let raw = payload
                .get("priority")
                .or_else(|| arguments.get(1))
                .ok_or_else(|| RouteError::InvalidPayload {
                    event,
                    message: "missing priority".to_string(),
                })?;
            let priority = Priority::deserialize(raw).map_err(|e| RouteError::InvalidPayload {
                event,
                message: e.to_string(),
            })?;
            StoreUpdate::ItemPrioritySet { id, priority }
        }
        EventKind::CategoryCreated => {
            StoreUpdate::CategoryUpserted(entity::<Category>(event, payload)?)
        }
        EventKind::CategoryUpdated => {
            StoreUpdate::CategoryReplaced(entity::<Category>(event, payload)?)
        }
        EventKind::CategoryDeleted => {
            StoreUpdate::CategoryRemoved(CategoryId(id_of(event, payload)?))
        }
    };
    Ok(update)
}

fn entity<T: DeserializeOwned>(event: EventKind, payload: &Value) -> Result<T, RouteError> {
    T::deserialize(payload).map_err(|e| RouteError::InvalidPayload {
        event,
        message: e.to_string(),
    })
}

/// Id from a number, a numeric string or an object's `id` field
fn id_of(event: EventKind, payload: &Value) -> Result<i64, RouteError> {
    let id = match payload {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("id").and_then(|id| match id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }),
        _ => None,
    };
    id.ok_or_else(|| RouteError::InvalidId {
        event,
        payload: payload.to_string(),
    })
}
