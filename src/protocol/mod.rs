pub mod envelope;
pub mod resource_ref;

pub use envelope::{
    DeliveryReceipt, DeliveryStatus, Envelope, MessageType, PayloadEncoding, ReceiptStatus,
    ENVELOPE_VERSION, QUEUED_IN_OUTBOX,
};
pub use resource_ref::{ResourceRef, ResourceRefError, ResourceType};
