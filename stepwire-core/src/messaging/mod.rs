//! Schema-checked publish and subscribe on top of a [`Broker`](crate::broker::Broker).

pub mod catalog;
pub mod envelope;
pub mod handler;
pub mod policy;
pub mod properties;
pub mod publisher;
pub mod subscriber;

pub use catalog::{CatalogBuilder, CatalogEntry, MessageCatalog, MessageType};
pub use envelope::{DeliveryAttributes, MessageEnvelope};
pub use handler::{
    Delivery, HandlerFn, HandlerRegistry, HandlerRegistryBuilder, MessageHandler,
    handler_fn,
};
pub use policy::{DeliveryOutcome, Disposition, FailurePolicy};
pub use properties::{
    PropertyCodecError, PropertyMap, RawProperties, decode_properties,
    encode_properties, normalize_properties,
};
pub use publisher::{PublishReceipt, Publisher};
pub use subscriber::{Subscriber, SubscriberSettings, SubscriberStatus};
