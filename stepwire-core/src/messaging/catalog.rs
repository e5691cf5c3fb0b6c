//! Immutable registry of message types and their schemas.
//!
//! A message type's schema is its Rust types: `Data` for the envelope
//! payload and `Properties` for the string headers. Validation is the act of
//! deserializing into those types.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MessagingError, Result, SchemaTarget};
use crate::messaging::properties::{PropertyMap, decode_properties};

/// A named message type with typed payload and property schemas.
pub trait MessageType: Send + Sync + 'static {
    /// Wire name carried in the envelope's `type` field.
    const TYPE: &'static str;

    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

    type Properties: Serialize + DeserializeOwned + Send + Sync + 'static;
}

type DataCheck = fn(&Value) -> std::result::Result<(), serde_json::Error>;
type PropertyCheck = fn(&PropertyMap) -> std::result::Result<(), String>;

fn check_data<M: MessageType>(
    value: &Value,
) -> std::result::Result<(), serde_json::Error> {
    M::Data::deserialize(value).map(|_| ())
}

fn check_properties<M: MessageType>(
    properties: &PropertyMap,
) -> std::result::Result<(), String> {
    decode_properties::<M::Properties>(properties)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

/// Schema pair for one message type.
#[derive(Clone, Copy)]
pub struct CatalogEntry {
    message_type: &'static str,
    data: DataCheck,
    properties: PropertyCheck,
}

impl fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

impl CatalogEntry {
    fn of<M: MessageType>() -> Self {
        Self {
            message_type: M::TYPE,
            data: check_data::<M>,
            properties: check_properties::<M>,
        }
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn validate_data(&self, data: &Value) -> Result<()> {
        (self.data)(data).map_err(|err| {
            MessagingError::schema(self.message_type, SchemaTarget::Data, err)
        })
    }

    pub fn validate_properties(&self, properties: &PropertyMap) -> Result<()> {
        (self.properties)(properties).map_err(|reason| {
            MessagingError::schema(
                self.message_type,
                SchemaTarget::Properties,
                reason,
            )
        })
    }

    /// Checks data first, then properties.
    pub fn validate(&self, data: &Value, properties: &PropertyMap) -> Result<()> {
        self.validate_data(data)?;
        self.validate_properties(properties)
    }
}

/// Fixed set of message types known to a publisher or subscriber.
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    entries: HashMap<&'static str, CatalogEntry>,
}

impl MessageCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn lookup(&self, message_type: &str) -> Result<&CatalogEntry> {
        self.entries
            .get(message_type)
            .ok_or_else(|| MessagingError::unknown(message_type))
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.entries.contains_key(message_type)
    }

    pub fn message_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entries: HashMap<&'static str, CatalogEntry>,
    duplicate: Option<&'static str>,
}

impl CatalogBuilder {
    pub fn register<M: MessageType>(mut self) -> Self {
        if self.entries.insert(M::TYPE, CatalogEntry::of::<M>()).is_some() {
            self.duplicate.get_or_insert(M::TYPE);
        }
        self
    }

    /// Fails on the first type that was registered more than once.
    pub fn build(self) -> Result<MessageCatalog> {
        if let Some(message_type) = self.duplicate {
            return Err(MessagingError::DuplicateType {
                message_type: message_type.to_owned(),
            });
        }
        Ok(MessageCatalog {
            entries: self.entries,
        })
    }
}
