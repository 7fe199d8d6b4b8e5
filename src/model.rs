//! Entity and payload types for the task mirror.
//!
//! Everything here mirrors the server's JSON representation (camelCase field
//! names, integer ids, integer priorities). Entities are only ever produced by
//! server responses or hub events; the client never invents an id.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Errors raised while interpreting wire values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid priority: {0} (expected 1-4)")]
    InvalidPriority(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Server-assigned identifier of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

/// Server-assigned identifier of a category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<i64> for CategoryId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Item priority. Encoded on the wire as its integer level.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Critical,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Critical => "Critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Low
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl TryFrom<u8> for Priority {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            _ => Err(ModelError::InvalidPriority(value.to_string())),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return Priority::try_from(level);
        }
        Priority::ALL
            .into_iter()
            .find(|p| p.label().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ModelError::InvalidPriority(trimmed.to_string()))
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        // Levels normally arrive as integers; enum names are accepted as well.
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => {
                let level = n
                    .as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| D::Error::custom(ModelError::InvalidPriority(n.to_string())))?;
                Priority::try_from(level).map_err(D::Error::custom)
            }
            serde_json::Value::String(s) => s.parse().map_err(D::Error::custom),
            other => Err(D::Error::custom(ModelError::InvalidPriority(other.to_string()))),
        }
    }
}

/// A task as mirrored from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    /// Due/completion marker; independent of `is_completed`
    #[serde(default, with = "opt_timestamp")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_looped: bool,
    /// Denormalized at read time by the server, never refreshed locally
    #[serde(default)]
    pub category_color: Option<String>,
}

impl Item {
    pub fn new(id: impl Into<ItemId>, name: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            priority,
            category_id: None,
            ended_at: None,
            is_completed: false,
            is_looped: false,
            category_color: None,
        }
    }

    pub fn with_category(mut self, category_id: impl Into<CategoryId>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A category as mirrored from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub color: String,
}

impl Category {
    pub fn new(id: impl Into<CategoryId>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Body of item create/update requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub name: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub category_id: Option<CategoryId>,
    #[serde(default, with = "opt_timestamp")]
    pub ended_at: Option<DateTime<Utc>>,
    pub is_looped: bool,
}

impl ItemPayload {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority,
            category_id: None,
            ended_at: None,
            is_looped: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category_id: impl Into<CategoryId>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn with_ended_at(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self
    }

    pub fn looped(mut self, is_looped: bool) -> Self {
        self.is_looped = is_looped;
        self
    }
}

impl From<&Item> for ItemPayload {
    fn from(item: &Item) -> Self {
        Self {
            name: item.name.clone(),
            description: item.description.clone(),
            priority: item.priority,
            category_id: item.category_id,
            ended_at: item.ended_at,
            is_looped: item.is_looped,
        }
    }
}

/// Body of category create/update requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPayload {
    pub name: String,
    pub color: String,
}

impl CategoryPayload {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Server-side filters for listing items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    pub category_id: Option<CategoryId>,
    pub priority: Option<Priority>,
    pub is_looped: Option<bool>,
    pub is_completed: Option<bool>,
    pub search_term: Option<String>,
}

impl ItemFilter {
    pub fn category(mut self, category_id: impl Into<CategoryId>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn looped(mut self, is_looped: bool) -> Self {
        self.is_looped = Some(is_looped);
        self
    }

    pub fn completed(mut self, is_completed: bool) -> Self {
        self.is_completed = Some(is_completed);
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search_term = Some(term.into());
        self
    }

    /// Query parameters in the server's PascalCase naming. Empty search terms
    /// are omitted.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(id) = self.category_id {
            query.push(("CategoryId".to_string(), id.to_string()));
        }
        if let Some(priority) = self.priority {
            query.push(("Priority".to_string(), priority.level().to_string()));
        }
        if let Some(looped) = self.is_looped {
            query.push(("IsLooped".to_string(), looped.to_string()));
        }
        if let Some(completed) = self.is_completed {
            query.push(("IsCompleted".to_string(), completed.to_string()));
        }
        if let Some(term) = self.search_term.as_deref().filter(|t| !t.is_empty()) {
            query.push(("SearchTerm".to_string(), term.to_string()));
        }
        query
    }
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Registration request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub user_name: String,
    pub email: String,
    pub password: String,
}

/// Parse a timestamp as sent by the server or entered in a form.
///
/// Accepts RFC 3339 and zone-less `YYYY-MM-DDTHH:MM[:SS[.fff]]`; zone-less
/// values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ModelError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ModelError::InvalidTimestamp(raw.to_string()))
}

mod opt_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => super::parse_timestamp(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_item_from_server_json() {
        let item: Item = serde_json::from_value(json!({
            "id": 42,
            "name": "Buy milk",
            "description": null,
            "priority": 1,
            "categoryId": 3,
            "endedAt": "2024-05-01T10:30:00",
            "isCompleted": false,
            "isLooped": true,
            "categoryColor": "#1976d2",
            "userId": "ignored"
        }))
        .unwrap();

        assert_eq!(item.id, ItemId(42));
        assert_eq!(item.priority, Priority::Low);
        assert_eq!(item.category_id, Some(CategoryId(3)));
        assert_eq!(
            item.ended_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap())
        );
        assert!(item.is_looped);
        assert_eq!(item.category_color.as_deref(), Some("#1976d2"));
    }

    #[test]
    fn test_item_missing_optional_fields() {
        let item: Item =
            serde_json::from_value(json!({"id": 1, "name": "A", "priority": 2})).unwrap();
        assert_eq!(item.category_id, None);
        assert_eq!(item.ended_at, None);
        assert!(!item.is_completed);
    }

    #[test]
    fn test_priority_rejects_out_of_range() {
        let result: Result<Item, _> =
            serde_json::from_value(json!({"id": 1, "name": "A", "priority": 5}));
        assert!(result.is_err());
        assert!(Priority::try_from(0).is_err());
    }

    #[test]
    fn test_priority_accepts_names() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("3".parse::<Priority>().unwrap(), Priority::High);
        let p: Priority = serde_json::from_value(json!("Medium")).unwrap();
        assert_eq!(p, Priority::Medium);
        assert_eq!(serde_json::to_value(Priority::High).unwrap(), json!(3));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02T03:04:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-01-02T05:04:00+02:00").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let payload = ItemPayload::new("Buy milk", Priority::Low).with_category(2);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["name"], "Buy milk");
        assert_eq!(value["priority"], 1);
        assert_eq!(value["categoryId"], 2);
        assert_eq!(value["endedAt"], serde_json::Value::Null);
        assert_eq!(value["isLooped"], false);
    }

    #[test]
    fn test_filter_query() {
        let filter = ItemFilter::default()
            .category(4)
            .priority(Priority::High)
            .completed(false)
            .search("");
        assert_eq!(
            filter.to_query(),
            vec![
                ("CategoryId".to_string(), "4".to_string()),
                ("Priority".to_string(), "3".to_string()),
                ("IsCompleted".to_string(), "false".to_string()),
            ]
        );
    }
}
