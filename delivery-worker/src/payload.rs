//! Outbound webhook body and signature.
//!
//! The body's `idempotency` field is the lead's ingestion key so buyers can
//! dedupe across retried deliveries; the per-attempt delivery id only ever
//! travels in the `X-LeadGen-Delivery-Id` header.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::worker::LeadDelivery;

pub const EVENT_LEAD_DELIVERED: &str = "lead.delivered";
pub const USER_AGENT: &str = "LeadGen/1.0";

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookData {
    pub lead_id: i64,
    pub received_at: DateTime<Utc>,
    pub delivered_at: DateTime<Utc>,
    pub idempotency: String,
    pub contact: Contact,
    pub details: Details,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub postal_code: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Details {
    pub message: Option<String>,
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub price: Option<f64>,
    pub buyer_id: i64,
}

/// Build the payload from authoritative lead state. Deterministic apart from
/// `delivered_at`, which the caller stamps once per attempt.
pub fn build_payload(lead: &LeadDelivery, delivered_at: DateTime<Utc>) -> WebhookPayload {
    WebhookPayload {
        event: EVENT_LEAD_DELIVERED.to_owned(),
        data: WebhookData {
            lead_id: lead.id,
            received_at: lead.created_at,
            delivered_at,
            idempotency: lead.idempotency_key.clone(),
            contact: Contact {
                name: lead.name.clone(),
                phone: lead.phone.clone(),
                email: lead.email.clone(),
                postal_code: lead.postal_code.clone(),
            },
            details: Details {
                message: lead.message.clone(),
                source: lead.source_key.clone(),
            },
            metadata: Metadata {
                price: lead.price,
                buyer_id: lead.buyer_id.expect("payload is only built for routed leads"),
            },
        },
    }
}

/// Hex HMAC-SHA256 of the exact bytes sent as the request body.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lead() -> LeadDelivery {
        LeadDelivery {
            id: 42,
            status: "routed".to_owned(),
            buyer_id: Some(7),
            created_at: DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            idempotency_key: "idem_0000000000000001".to_owned(),
            name: "Jane".to_owned(),
            email: "j@x.com".to_owned(),
            phone: "+15125550123".to_owned(),
            postal_code: "78701".to_owned(),
            message: Some("leaky faucet".to_owned()),
            price: Some(45.0),
            source_key: "aus-plb-v1".to_owned(),
            buyer_webhook_url: Some("https://buyer.example/hooks".to_owned()),
            buyer_webhook_secret: None,
            webhook_url_override: None,
            webhook_secret_override: None,
        }
    }

    #[test]
    fn payload_shape_matches_the_wire_format() {
        let delivered_at = DateTime::parse_from_rfc3339("2024-06-01T10:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = build_payload(&lead(), delivered_at);
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["event"], "lead.delivered");
        assert_eq!(value["data"]["lead_id"], 42);
        assert_eq!(value["data"]["idempotency"], "idem_0000000000000001");
        assert_eq!(
            value["data"]["contact"],
            json!({
                "name": "Jane",
                "phone": "+15125550123",
                "email": "j@x.com",
                "postal_code": "78701"
            })
        );
        assert_eq!(
            value["data"]["details"],
            json!({"message": "leaky faucet", "source": "aus-plb-v1"})
        );
        assert_eq!(
            value["data"]["metadata"],
            json!({"price": 45.0, "buyer_id": 7})
        );
    }

    #[test]
    fn payload_is_deterministic_for_fixed_inputs() {
        let delivered_at = Utc::now();
        let a = serde_json::to_string(&build_payload(&lead(), delivered_at)).unwrap();
        let b = serde_json::to_string(&build_payload(&lead(), delivered_at)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signature_matches_known_hmac_sha256_vector() {
        // RFC 2202-style vector.
        assert_eq!(
            sign("key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
