use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::rabbitmq::broker::IncomingDelivery;
use crate::rabbitmq::errors::{BusError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as seen by producers and handlers. The body is opaque to the bus.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Envelope {
    id: Uuid,
    creation_time: Option<DateTime<Utc>>,
    routing_key: String,
    content_type: Option<String>,
    message_id: Option<String>,
    body: Vec<u8>,
}

impl Envelope {
    /// Creates an outbound envelope stamped with the current time.
    pub fn new(
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
        content_type: Option<String>,
    ) -> Result<Self> {
        let routing_key = routing_key.into();
        if routing_key.is_empty() {
            return Err(BusError::invalid_argument("routing key"));
        }

        Ok(Envelope {
            id: Uuid::new_v4(),
            creation_time: Some(Utc::now()),
            routing_key,
            content_type,
            message_id: Some(Uuid::new_v4().to_string()),
            body: body.into(),
        })
    }

    /// Rebuilds an envelope from a broker delivery. Optional metadata stays
    /// absent when the broker did not carry it.
    pub fn from_delivery(delivery: IncomingDelivery) -> Self {
        let creation_time = delivery
            .properties
            .timestamp
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Envelope {
            id: Uuid::new_v4(),
            creation_time,
            routing_key: delivery.routing_key,
            content_type: delivery.properties.content_type,
            message_id: delivery.properties.message_id,
            body: delivery.body,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn body_as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| BusError::InvalidArgument(format!("body is not valid UTF-8: {}", e)))
    }

    pub fn deserialize_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A handler's verdict on a delivery.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Ack,
    NackDiscard,
    NackRequeue,
}

impl FromStr for Disposition {
    type Err = BusError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "ack" => Ok(Disposition::Ack),
            "nack_discard" => Ok(Disposition::NackDiscard),
            "nack_requeue" => Ok(Disposition::NackRequeue),
            other => Err(BusError::InvalidDisposition(format!(
                "unexpected acknowledgement mode '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<u8> for Disposition {
    type Error = BusError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Disposition::Ack),
            1 => Ok(Disposition::NackDiscard),
            2 => Ok(Disposition::NackRequeue),
            other => Err(BusError::InvalidDisposition(format!(
                "unexpected acknowledgement mode {}",
                other
            ))),
        }
    }
}
