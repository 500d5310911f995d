//! Message types and utilities for the consumption pipeline.

use crate::types::{Offset, PartitionId, Timestamp};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a new unique message ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a message ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable record fetched from one partition of the consumed log.
///
/// Owned by the intake path until handed to the aggregator; never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Partition the message was fetched from
    pub partition: PartitionId,

    /// Offset within the partition
    pub offset: Offset,

    /// Optional application key, used for grouping and ordering
    pub key: Option<String>,

    /// Message payload (zero-copy)
    pub payload: Bytes,

    /// Optional message headers
    pub headers: Option<HashMap<String, String>>,

    /// Time the message entered the pipeline
    pub received_at: Timestamp,
}

impl Message {
    /// Create a new message for the given partition and offset.
    #[must_use]
    pub fn new(partition: PartitionId, offset: Offset, payload: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            partition,
            offset,
            key: None,
            payload,
            headers: None,
            received_at: Utc::now(),
        }
    }

    /// Create a message builder for more complex construction.
    #[must_use]
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Check if the message has headers.
    #[must_use]
    pub fn has_headers(&self) -> bool {
        self.headers.is_some()
    }

    /// Get a header value by key.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.as_ref()?.get(key).map(String::as_str)
    }

    /// Get the message key as a string slice.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// Builder for constructing messages with various options.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    partition: Option<PartitionId>,
    offset: Option<Offset>,
    key: Option<String>,
    payload: Option<Bytes>,
    headers: Option<HashMap<String, String>>,
}

impl MessageBuilder {
    /// Set the source partition.
    #[must_use]
    pub fn partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set the message offset.
    #[must_use]
    pub fn offset(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set the application key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the message payload.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.get_or_insert_with(HashMap::new).insert(key.into(), value.into());
        self
    }

    /// Add multiple headers.
    #[must_use]
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        match self.headers {
            Some(ref mut existing) => existing.extend(headers),
            None => self.headers = Some(headers),
        }
        self
    }

    /// Build the message.
    ///
    /// # Errors
    /// Returns an error if the partition or offset is missing.
    pub fn build(self) -> crate::Result<Message> {
        let partition = self.partition.ok_or_else(|| crate::Error::InvalidMessage {
            message: "Partition is required".to_string(),
        })?;

        let offset = self.offset.ok_or_else(|| crate::Error::InvalidMessage {
            message: "Offset is required".to_string(),
        })?;

        Ok(Message {
            id: MessageId::new(),
            partition,
            offset,
            key: self.key,
            payload: self.payload.unwrap_or_else(Bytes::new),
            headers: self.headers,
            received_at: Utc::now(),
        })
    }
}
