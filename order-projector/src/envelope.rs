//! Decodes the CloudEvents envelope the publisher writes into the
//! `(aggregate_id, version, event)` triple the projector's idempotence
//! policy operates on.

use cloudevents::event::{AttributesReader, Data, Event as CeEvent, ExtensionValue};
use order_domain::OrderEvent;
use uuid::Uuid;

use crate::error::ProjectionError;

/// A decoded wire event, ready to be dispatched against the read model.
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    /// The aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// The aggregate version this event carries it to.
    pub version: i64,
    /// The decoded event payload.
    pub event: OrderEvent,
}

/// Decodes a raw Kafka payload (a JSON-encoded CloudEvent, per
/// `order_publisher::KafkaEventPublisher::encode`) into a `DecodedEnvelope`.
///
/// # Errors
///
/// Returns `ProjectionError::PoisonMessage` if the payload is not a valid
/// CloudEvents envelope, is missing the `aggregateid`/`version` extension
/// attributes, or its `data` does not decode as an `OrderEvent`.
pub fn decode(payload: &[u8]) -> Result<DecodedEnvelope, ProjectionError> {
    let ce: CeEvent = serde_json::from_slice(payload).map_err(|e| {
        poison("undecodable", &format!("invalid CloudEvents envelope: {e}"))
    })?;

    let event_type = ce.ty().to_string();

    let aggregate_id_str = extension_string(&ce, "aggregateid")
        .ok_or_else(|| poison(&event_type, "missing aggregateid extension"))?;
    let aggregate_id: Uuid = aggregate_id_str
        .parse()
        .map_err(|e| poison(&event_type, &format!("invalid aggregateid: {e}")))?;

    let version_str = extension_string(&ce, "version")
        .ok_or_else(|| poison(&event_type, "missing version extension"))?;
    let version: i64 = version_str
        .parse()
        .map_err(|e| poison(&event_type, &format!("invalid version: {e}")))?;

    let data = ce
        .data()
        .ok_or_else(|| poison(&event_type, "missing data payload"))?;
    let bytes = match data {
        Data::Binary(b) => b.clone(),
        Data::String(s) => s.clone().into_bytes(),
        Data::Json(v) => serde_json::to_vec(v)
            .map_err(|e| poison(&event_type, &format!("re-encoding JSON data: {e}")))?,
    };

    let event: OrderEvent = serde_json::from_slice(&bytes)
        .map_err(|e| poison(&event_type, &format!("decoding event payload: {e}")))?;

    Ok(DecodedEnvelope {
        aggregate_id,
        version,
        event,
    })
}

fn extension_string(ce: &CeEvent, name: &str) -> Option<String> {
    match ce.extension(name) {
        Some(ExtensionValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn poison(event_type: &str, reason: &str) -> ProjectionError {
    ProjectionError::PoisonMessage {
        event_type: event_type.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cloudevents::event::{Data as CeData, EventBuilder, EventBuilderV10};
    use order_domain::{Order, OrderItem};
    use sourcerer::Event as _;
    use url::Url;

    fn encode(aggregate_id: Uuid, version: i64, event: &OrderEvent) -> Vec<u8> {
        let data = serde_json::to_vec(event).unwrap();
        let ce = EventBuilderV10::new()
            .id(Uuid::new_v4().to_string())
            .ty(event.event_type())
            .source(Url::parse(event.event_source()).unwrap())
            .time(Utc::now())
            .extension("aggregateid", aggregate_id.to_string())
            .extension("version", version.to_string())
            .data("application/json", CeData::from(data))
            .build()
            .unwrap();
        serde_json::to_vec(&ce).unwrap()
    }

    #[test]
    fn decodes_a_well_formed_envelope() {
        let aggregate_id = Uuid::new_v4();
        let event = Order::create(
            Uuid::new_v4(),
            vec![OrderItem {
                product_id: Uuid::new_v4(),
                product_name: "widget".to_string(),
                quantity: 1,
                unit_price: 4.0,
            }],
            "addr".to_string(),
        )
        .unwrap();
        let payload = encode(aggregate_id, 1, &event);

        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.aggregate_id, aggregate_id);
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.event, event);
    }

    #[test]
    fn rejects_garbage_payloads() {
        let err = decode(b"not json").unwrap_err();
        assert!(matches!(err, ProjectionError::PoisonMessage { .. }));
    }

    #[test]
    fn rejects_envelope_missing_extensions() {
        let ce = EventBuilderV10::new()
            .id(Uuid::new_v4().to_string())
            .ty("Created")
            .source(Url::parse("urn:order-service:order").unwrap())
            .data("application/json", CeData::from(b"{}".to_vec()))
            .build()
            .unwrap();
        let payload = serde_json::to_vec(&ce).unwrap();

        let err = decode(&payload).unwrap_err();
        assert!(matches!(err, ProjectionError::PoisonMessage { .. }));
    }
}
