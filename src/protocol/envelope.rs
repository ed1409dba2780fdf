use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource_ref::ResourceRef;

/// Envelope wire version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Reason attached to the synthetic receipt returned when an envelope was
/// parked in the outbox instead of being handed to the transport.
pub const QUEUED_IN_OUTBOX: &str = "queued-in-outbox";

/// Message classes carried between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Verification,
    Attestation,
    AttestationAck,
    ContactRequest,
    ItemKey,
    SpaceInvite,
    GroupKeyRotation,
    Ack,
    Content,
    ProfileUpdate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Verification => "verification",
            MessageType::Attestation => "attestation",
            MessageType::AttestationAck => "attestation-ack",
            MessageType::ContactRequest => "contact-request",
            MessageType::ItemKey => "item-key",
            MessageType::SpaceInvite => "space-invite",
            MessageType::GroupKeyRotation => "group-key-rotation",
            MessageType::Ack => "ack",
            MessageType::Content => "content",
            MessageType::ProfileUpdate => "profile-update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Json,
    Cbor,
    Base64,
}

impl Default for PayloadEncoding {
    fn default() -> Self {
        PayloadEncoding::Json
    }
}

/// Point-to-point message envelope. `id` is the deduplication key across the
/// whole delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u8,
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from_id: String,
    pub to_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    pub payload: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
}

impl Envelope {
    pub fn new(
        message_type: MessageType,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            from_id: from_id.into(),
            to_id: to_id.into(),
            created_at: Utc::now(),
            encoding: PayloadEncoding::Json,
            payload: payload.into(),
            signature: String::new(),
            resource_ref: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_resource_ref(mut self, resource_ref: ResourceRef) -> Self {
        self.resource_ref = Some(resource_ref);
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Accepted,
    Delivered,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeliveryReceipt {
    pub fn new(message_id: impl Into<String>, status: ReceiptStatus) -> Self {
        Self {
            message_id: message_id.into(),
            status,
            timestamp: Utc::now(),
            reason: None,
        }
    }

    /// Synthetic, non-terminal receipt for an envelope parked in the outbox.
    pub fn queued(message_id: impl Into<String>) -> Self {
        Self {
            reason: Some(QUEUED_IN_OUTBOX.to_string()),
            ..Self::new(message_id, ReceiptStatus::Accepted)
        }
    }

    pub fn failed(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(message_id, ReceiptStatus::Failed)
        }
    }

    pub fn is_queued(&self) -> bool {
        self.reason.as_deref() == Some(QUEUED_IN_OUTBOX)
    }
}

/// User-facing delivery state of a single outbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Queued,
    Delivered,
    Acknowledged,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::new(MessageType::SpaceInvite, "alice", "bob", "{}");
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["type"], "space-invite");
        assert_eq!(json["fromId"], "alice");
        assert_eq!(json["toId"], "bob");
        assert_eq!(json["encoding"], "json");
        assert!(json.get("resourceRef").is_none());
    }

    #[test]
    fn test_envelope_json_roundtrip_with_ref() {
        let env = Envelope::new(MessageType::Content, "alice", "bob", "payload")
            .with_resource_ref(ResourceRef::parse("wot:space:abc").unwrap());

        let decoded = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn test_unique_ids() {
        let a = Envelope::new(MessageType::Ack, "a", "b", "");
        let b = Envelope::new(MessageType::Ack, "a", "b", "");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_message_type_names_match_serde() {
        for ty in [
            MessageType::AttestationAck,
            MessageType::GroupKeyRotation,
            MessageType::ProfileUpdate,
            MessageType::ItemKey,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_queued_receipt() {
        let receipt = DeliveryReceipt::queued("m1");
        assert_eq!(receipt.status, ReceiptStatus::Accepted);
        assert!(receipt.is_queued());
        assert!(!DeliveryReceipt::new("m1", ReceiptStatus::Delivered).is_queued());
    }
}
