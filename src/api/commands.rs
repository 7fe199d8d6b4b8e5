//! Command operations against the REST API.
//!
//! Every operation follows the same shape:
//! - validate input locally (no request on failure)
//! - send one request with the session's bearer token
//! - on acknowledgement apply exactly one store update
//!
//! Failures never touch the store. An acknowledgement that arrives after the
//! session changed is returned to the caller but not applied.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    server_message, ApiEnvelope, ApiRequest, CommandError, Method, RequestExecutor,
};
use crate::model::{
    Category, CategoryId, CategoryPayload, Credentials, Item, ItemFilter, ItemId, ItemPayload,
    Priority, Registration,
};
use crate::session::{Credential, SessionHolder};
use crate::store::{SharedStore, StoreUpdate};

/// Mutation surface of the client
#[derive(Clone)]
pub struct Commands {
    executor: Arc<dyn RequestExecutor>,
    session: SessionHolder,
    store: SharedStore,
}

impl Commands {
    pub fn new(
        executor: Arc<dyn RequestExecutor>,
        session: SessionHolder,
        store: SharedStore,
    ) -> Self {
        Self {
            executor,
            session,
            store,
        }
    }

    pub fn session(&self) -> &SessionHolder {
        &self.session
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// List items and rehydrate the item collection
    pub async fn fetch_items(&self, filter: &ItemFilter) -> Result<Vec<Item>, CommandError> {
        const FAILED: &str = "Failed to fetch items";
        let request = ApiRequest::new(Method::Get, "Items").with_query(filter.to_query());
        let reply = self.send::<Vec<Item>>(request, FAILED).await?;
        let items = reply.data.clone().unwrap_or_default();

        debug!("Fetched {} items", items.len());
        self.commit(&reply, StoreUpdate::ItemsLoaded(items.clone()));
        Ok(items)
    }

    pub async fn create_item(&self, payload: &ItemPayload) -> Result<Item, CommandError> {
        const FAILED: &str = "Failed to create item";
        require_name(&payload.name, "Item name is required")?;
        let request = ApiRequest::new(Method::Post, "Items").with_body(to_body(payload, FAILED)?);
        let reply = self.send::<Item>(request, FAILED).await?;
        let item = required(reply.data.clone(), FAILED)?;

        self.commit(&reply, StoreUpdate::ItemUpserted(item.clone()));
        Ok(item)
    }

    pub async fn update_item(&self, id: ItemId, payload: &ItemPayload) -> Result<Item, CommandError> {
        const FAILED: &str = "Failed to update item";
        require_name(&payload.name, "Item name is required")?;
        let request = ApiRequest::new(Method::Put, format!("Items/{}", id))
            .with_body(to_body(payload, FAILED)?);
        let reply = self.send::<Item>(request, FAILED).await?;
        let item = required(reply.data.clone(), FAILED)?;

        self.commit(&reply, StoreUpdate::ItemReplaced(item.clone()));
        Ok(item)
    }

    pub async fn delete_item(&self, id: ItemId) -> Result<ItemId, CommandError> {
        const FAILED: &str = "Failed to delete item";
        let request = ApiRequest::new(Method::Delete, format!("Items/{}", id));
        let reply = self.send::<Value>(request, FAILED).await?;

        self.commit(&reply, StoreUpdate::ItemRemoved(id));
        Ok(id)
    }

    pub async fn complete_item(&self, id: ItemId) -> Result<ItemId, CommandError> {
        const FAILED: &str = "Failed to complete item";
        let request = ApiRequest::new(Method::Post, format!("Items/{}/complete", id));
        let reply = self.send::<Value>(request, FAILED).await?;

        self.commit(&reply, StoreUpdate::ItemCompleted(id));
        Ok(id)
    }

    /// Flip the loop flag on the server. Returns the resulting flag.
    ///
    /// The store gets an absolute value: the server's answer when it carries
    /// one, otherwise the negation of the flag seen before the request. The
    /// expected flag is registered with the store up front so the hub's echo
    /// of this toggle cannot flip it back.
    pub async fn toggle_loop(&self, id: ItemId) -> Result<bool, CommandError> {
        const FAILED: &str = "Failed to toggle loop";
        let expected = !self.store.item(id).map_or(false, |item| item.is_looped);
        self.store.expect_loop(id, expected);

        let request = ApiRequest::new(Method::Post, format!("Items/{}/toggle-loop", id));
        let reply = match self.send::<Value>(request, FAILED).await {
            Ok(reply) => reply,
            Err(e) => {
                self.store.forget_loop(id);
                return Err(e);
            }
        };

        let looped = reply.data.as_ref().and_then(loop_flag).unwrap_or(expected);
        if self.commit(&reply, StoreUpdate::ItemLoopSet { id, looped }) {
            self.store.settle_loop(id, looped);
        }
        Ok(looped)
    }

    pub async fn update_priority(
        &self,
        id: ItemId,
        priority: Priority,
    ) -> Result<Priority, CommandError> {
        const FAILED: &str = "Failed to update priority";
        let request = ApiRequest::new(Method::Patch, format!("Items/{}/priority", id))
            .with_body(json!({ "priority": priority }));
        let reply = self.send::<Value>(request, FAILED).await?;

        self.commit(&reply, StoreUpdate::ItemPrioritySet { id, priority });
        Ok(priority)
    }

    /// Delete several items. An empty list is a no-op without a request.
    pub async fn bulk_delete_items(&self, ids: &[ItemId]) -> Result<Vec<ItemId>, CommandError> {
        const FAILED: &str = "Failed to delete items";
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = ApiRequest::new(Method::Post, "BulkOperations/items/bulk-delete")
            .with_body(json!(ids));
        let reply = self.send::<Value>(request, FAILED).await?;

        info!("Bulk deleted {} items", ids.len());
        self.commit(&reply, StoreUpdate::ItemsRemoved(ids.to_vec()));
        Ok(ids.to_vec())
    }

    /// Complete several items. An empty list is a no-op without a request.
    pub async fn bulk_complete_items(&self, ids: &[ItemId]) -> Result<Vec<ItemId>, CommandError> {
        const FAILED: &str = "Failed to complete items";
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = ApiRequest::new(Method::Post, "BulkOperations/items/bulk-complete")
            .with_body(json!(ids));
        let reply = self.send::<Value>(request, FAILED).await?;

        info!("Bulk completed {} items", ids.len());
        self.commit(&reply, StoreUpdate::ItemsCompleted(ids.to_vec()));
        Ok(ids.to_vec())
    }

    // ========================================================================
    // Categories
    // ========================================================================

    /// List categories and rehydrate the category collection
    pub async fn fetch_categories(&self) -> Result<Vec<Category>, CommandError> {
        const FAILED: &str = "Failed to fetch categories";
        let request = ApiRequest::new(Method::Get, "Categories");
        let reply = self.send::<Vec<Category>>(request, FAILED).await?;
        let categories = reply.data.clone().unwrap_or_default();

        debug!("Fetched {} categories", categories.len());
        self.commit(&reply, StoreUpdate::CategoriesLoaded(categories.clone()));
        Ok(categories)
    }

    pub async fn create_category(&self, payload: &CategoryPayload) -> Result<Category, CommandError> {
        const FAILED: &str = "Failed to create category";
        require_name(&payload.name, "Category name is required")?;
        let request =
            ApiRequest::new(Method::Post, "Categories").with_body(to_body(payload, FAILED)?);
        let reply = self.send::<Category>(request, FAILED).await?;
        let category = required(reply.data.clone(), FAILED)?;

        self.commit(&reply, StoreUpdate::CategoryUpserted(category.clone()));
        Ok(category)
    }

    pub async fn update_category(
        &self,
        id: CategoryId,
        payload: &CategoryPayload,
    ) -> Result<Category, CommandError> {
        const FAILED: &str = "Failed to update category";
        require_name(&payload.name, "Category name is required")?;
        let request = ApiRequest::new(Method::Put, format!("Categories/{}", id))
            .with_body(to_body(payload, FAILED)?);
        let reply = self.send::<Category>(request, FAILED).await?;
        let category = required(reply.data.clone(), FAILED)?;

        self.commit(&reply, StoreUpdate::CategoryReplaced(category.clone()));
        Ok(category)
    }

    /// Delete a category. Items referencing it keep the dangling id.
    ///
    /// A category that is still in use is rejected by the server; check
    /// [`CommandError::status`] to tell that apart from other failures.
    pub async fn delete_category(&self, id: CategoryId) -> Result<CategoryId, CommandError> {
        const FAILED: &str = "Failed to delete category";
        let request = ApiRequest::new(Method::Delete, format!("Categories/{}", id));
        let reply = self.send::<Value>(request, FAILED).await?;

        self.commit(&reply, StoreUpdate::CategoryRemoved(id));
        Ok(id)
    }

    /// Delete a category together with every item in it
    pub async fn delete_category_with_items(
        &self,
        id: CategoryId,
    ) -> Result<CategoryId, CommandError> {
        const FAILED: &str = "Failed to delete category with items";
        let request = ApiRequest::new(Method::Delete, format!("Categories/{}/with-items", id));
        let reply = self.send::<Value>(request, FAILED).await?;

        self.commit(&reply, StoreUpdate::CategoryRemovedWithItems(id));
        Ok(id)
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Log in and store the issued credential in the session
    pub async fn login(&self, credentials: &Credentials) -> Result<Credential, CommandError> {
        const FAILED: &str = "Login failed";
        if credentials.email.trim().is_empty() || credentials.password.is_empty() {
            return Err(CommandError::Validation(
                "Email and password are required".to_string(),
            ));
        }
        let request =
            ApiRequest::new(Method::Post, "Auth/login").with_body(to_body(credentials, FAILED)?);
        let token = required(self.send::<String>(request, FAILED).await?.data, FAILED)?;
        let credential = Credential::new(token).ok_or_else(|| CommandError::Decode {
            message: FAILED.to_string(),
            cause: "empty token".to_string(),
        })?;

        self.session.acquire(credential.clone());
        Ok(credential)
    }

    /// Register an account. If the server issues a credential right away it is
    /// stored in the session.
    pub async fn register(
        &self,
        registration: &Registration,
    ) -> Result<Option<Credential>, CommandError> {
        const FAILED: &str = "Registration failed";
        if registration.user_name.trim().is_empty()
            || registration.email.trim().is_empty()
            || registration.password.is_empty()
        {
            return Err(CommandError::Validation(
                "User name, email and password are required".to_string(),
            ));
        }
        let request = ApiRequest::new(Method::Post, "Auth/register")
            .with_body(to_body(registration, FAILED)?);
        let reply = self.send::<Value>(request, FAILED).await?;

        let credential = reply
            .data
            .as_ref()
            .and_then(Value::as_str)
            .and_then(Credential::new);
        if let Some(credential) = &credential {
            self.session.acquire(credential.clone());
        }
        Ok(credential)
    }

    /// Drop the session credential and empty the mirror. Returns whether a
    /// credential was present.
    pub fn logout(&self) -> bool {
        let had = self.session.clear();
        self.store.apply(StoreUpdate::Cleared);
        had
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Apply an acknowledged update unless the session changed while the
    /// request was in flight. Returns whether the update was applied.
    fn commit<T>(&self, reply: &Reply<T>, update: StoreUpdate) -> bool {
        if self.session.current() != reply.credential {
            info!("Session changed while in flight, dropping {}", update.kind());
            return false;
        }
        self.store.apply(update);
        true
    }

    /// Send one request and unwrap the envelope's `data`
    async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        fallback: &str,
    ) -> Result<Reply<T>, CommandError> {
        let credential = self.session.current();
        let bearer = credential.as_ref().map(|c| c.as_str().to_string());
        let request = request.with_bearer(bearer);
        let path = request.path.clone();

        let response = self.executor.execute(request).await.map_err(|e| {
            warn!("{} ({}): {}", fallback, path, e);
            CommandError::Transport {
                message: fallback.to_string(),
                cause: e.to_string(),
            }
        })?;

        if !response.is_success() {
            let message = server_message(&response.body).unwrap_or_else(|| fallback.to_string());
            warn!("{} ({}): {} {}", fallback, path, response.status, message);
            return Err(CommandError::Rejected {
                status: response.status,
                message,
            });
        }

        if response.body.trim().is_empty() {
            return Ok(Reply {
                data: None,
                credential,
            });
        }

        let envelope: ApiEnvelope<T> =
            serde_json::from_str(&response.body).map_err(|e| CommandError::Decode {
                message: fallback.to_string(),
                cause: e.to_string(),
            })?;

        if envelope.success == Some(false) {
            let message = envelope
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string());
            warn!("{} ({}): {}", fallback, path, message);
            return Err(CommandError::Rejected {
                status: response.status,
                message,
            });
        }

        Ok(Reply {
            data: envelope.data,
            credential,
        })
    }
}

/// Acknowledged response together with the credential it was sent under
struct Reply<T> {
    data: Option<T>,
    credential: Option<Credential>,
}

fn require_name(name: &str, message: &str) -> Result<(), CommandError> {
    if name.trim().is_empty() {
        Err(CommandError::Validation(message.to_string()))
    } else {
        Ok(())
    }
}

fn required<T>(data: Option<T>, fallback: &str) -> Result<T, CommandError> {
    data.ok_or_else(|| CommandError::Decode {
        message: fallback.to_string(),
        cause: "response carried no data".to_string(),
    })
}

fn to_body<T: serde::Serialize>(value: &T, fallback: &str) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Decode {
        message: fallback.to_string(),
        cause: e.to_string(),
    })
}

/// Loop flag carried by a toggle response: a bare bool or an item-like object
fn loop_flag(data: &Value) -> Option<bool> {
    match data {
        Value::Bool(flag) => Some(*flag),
        Value::Object(map) => map.get("isLooped").and_then(Value::as_bool),
        _ => None,
    }
}
