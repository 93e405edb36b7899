use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandDescriptor {
    pub name: String,
    pub usage: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    #[serde(alias = "is_enabled")]
    pub enabled: bool,
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            usage: None,
            description: None,
            category: None,
            enabled: true,
        }
    }
}

impl CommandDescriptor {
    pub fn usage_or_default(&self) -> String {
        match self.usage.as_deref().map(str::trim) {
            Some(usage) if !usage.is_empty() => usage.to_string(),
            _ => format!("?{}", self.name),
        }
    }

    pub fn category_or_default(&self) -> &str {
        match self.category.as_deref().map(str::trim) {
            Some(cat) if !cat.is_empty() => cat,
            _ => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Created,
    Updated,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl NotificationAction {
    /// Created and updated commands invalidate the local command table.
    pub fn requires_reload(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        }
    }
}

impl Default for NotificationAction {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub action: NotificationAction,
    #[serde(default)]
    pub command_name: String,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub changes: Map<String, Value>,
}

fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "notification id must be a string or number, got {other}"
        ))),
    }
}

fn null_as_empty_map<'de, D>(de: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("changes".to_string(), Value::String(other.to_string()));
            Ok(map)
        }
    }
}

/// Raw pending list. Rows are kept as JSON so one malformed row cannot
/// sink the rest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PendingNotifications {
    #[serde(default, deserialize_with = "null_as_empty_vec")]
    pub notifications: Vec<Value>,
}

impl PendingNotifications {
    /// Parses every row on its own, returning the good rows and the
    /// failures (row index and error).
    pub fn parse(self) -> (Vec<PendingNotification>, Vec<(usize, serde_json::Error)>) {
        let mut parsed = Vec::with_capacity(self.notifications.len());
        let mut rejected = Vec::new();
        for (index, row) in self.notifications.into_iter().enumerate() {
            match serde_json::from_value(row) {
                Ok(notification) => parsed.push(notification),
                Err(err) => rejected.push((index, err)),
            }
        }
        (parsed, rejected)
    }
}

fn null_as_empty_vec<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(de)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotCommands {
    #[serde(default, deserialize_with = "null_as_empty_vec")]
    pub commands: Vec<CommandDescriptor>,
}
