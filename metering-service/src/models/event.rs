//! Usage events.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use uuid::Uuid;

/// An event as submitted by a client, keyed by the external customer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub customer_id: String,
    pub event_name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub time_created: DateTime<Utc>,
    pub idempotency_id: String,
}

/// A stored event. Never mutated once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub organization_id: Uuid,
    pub customer_id: Uuid,
    pub event_name: String,
    pub properties: Map<String, Value>,
    pub time_created: DateTime<Utc>,
    pub idempotency_id: String,
    pub inserted_at: DateTime<Utc>,
}

impl Event {
    /// Numeric property value; numeric strings are accepted.
    pub fn property_decimal(&self, name: &str) -> Option<Decimal> {
        match self.properties.get(name)? {
            Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .ok(),
            Value::String(s) => Decimal::from_str(s).ok(),
            Value::Bool(b) => Some(if *b { Decimal::ONE } else { Decimal::ZERO }),
            _ => None,
        }
    }

    /// Property rendered as text, matching Postgres `properties->>'name'`.
    pub fn property_string(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(properties: Value) -> Event {
        Event {
            organization_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            event_name: "api_call".into(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            time_created: Utc::now(),
            idempotency_id: "evt_1".into(),
            inserted_at: Utc::now(),
        }
    }

    #[test]
    fn reads_numeric_and_string_properties() {
        let e = event(json!({"tokens": 12.5, "count": "7", "region": "eu"}));
        assert_eq!(e.property_decimal("tokens"), Some(Decimal::new(125, 1)));
        assert_eq!(e.property_decimal("count"), Some(Decimal::from(7)));
        assert_eq!(e.property_decimal("region"), None);
        assert_eq!(e.property_string("region").as_deref(), Some("eu"));
        assert_eq!(e.property_string("tokens").as_deref(), Some("12.5"));
    }
}
