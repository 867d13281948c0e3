// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Analytics event model.
//!
//! The batching pipeline treats an event as an opaque JSON record tagged with a
//! `type`. The helper constructors below fill in the conventional field names
//! used by the ingestion API (`userId`, `properties`, `traits`, ...).

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// Discriminator of an analytics event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    #[display("track")]
    Track,
    #[display("identify")]
    Identify,
    #[display("screen")]
    Screen,
    #[display("alias")]
    Alias,
    #[display("group")]
    Group,
    #[display("page")]
    Page,
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" => Ok(Self::Track),
            "identify" => Ok(Self::Identify),
            "screen" => Ok(Self::Screen),
            "alias" => Ok(Self::Alias),
            "group" => Ok(Self::Group),
            "page" => Ok(Self::Page),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }
}

/// A single analytics event.
///
/// Serialized flat: the `type` tag sits next to the event's own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        // The tag lives in `event_type`; a stray copy in the map would be emitted twice.
        fields.remove("type");
        Self { event_type, fields }
    }

    /// Builds an event from an arbitrary JSON object carrying a `type` tag.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(mut fields) = value else {
            return Err(EventError::NotAnObject);
        };
        let event_type = match fields.remove("type") {
            Some(Value::String(tag)) => tag.parse()?,
            Some(other) => return Err(EventError::UnknownType(other.to_string())),
            None => return Err(EventError::MissingType),
        };
        Ok(Self { event_type, fields })
    }

    /// Parses a JSON document into an event.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    #[must_use]
    pub fn track(user_id: impl Into<String>, event: impl Into<String>, properties: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("event".to_string(), Value::String(event.into()));
        fields.insert("properties".to_string(), properties);
        Self::new(EventType::Track, fields)
    }

    #[must_use]
    pub fn identify(user_id: impl Into<String>, traits: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("traits".to_string(), traits);
        Self::new(EventType::Identify, fields)
    }

    #[must_use]
    pub fn screen(user_id: impl Into<String>, name: impl Into<String>, properties: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("name".to_string(), Value::String(name.into()));
        fields.insert("properties".to_string(), properties);
        Self::new(EventType::Screen, fields)
    }

    #[must_use]
    pub fn alias(user_id: impl Into<String>, previous_id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("previousId".to_string(), Value::String(previous_id.into()));
        Self::new(EventType::Alias, fields)
    }

    #[must_use]
    pub fn group(user_id: impl Into<String>, group_id: impl Into<String>, traits: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("groupId".to_string(), Value::String(group_id.into()));
        fields.insert("traits".to_string(), traits);
        Self::new(EventType::Group, fields)
    }

    #[must_use]
    pub fn page(user_id: impl Into<String>, name: impl Into<String>, properties: Value) -> Self {
        let mut fields = Map::new();
        fields.insert("userId".to_string(), Value::String(user_id.into()));
        fields.insert("name".to_string(), Value::String(name.into()));
        fields.insert("properties".to_string(), properties);
        Self::new(EventType::Page, fields)
    }

    /// Sets an arbitrary field. Setting `type` is ignored.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if key != "type" {
            self.fields.insert(key, value);
        }
        self
    }

    #[must_use]
    pub fn with_context(self, context: Value) -> Self {
        self.with_field("context", context)
    }

    #[must_use]
    pub fn with_anonymous_id(self, anonymous_id: impl Into<String>) -> Self {
        self.with_field("anonymousId", Value::String(anonymous_id.into()))
    }

    #[must_use]
    pub fn with_timestamp(self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.with_field(
            "timestamp",
            Value::String(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        )
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub(crate) fn into_parts(self) -> (EventType, Map<String, Value>) {
        (self.event_type, self.fields)
    }
}
