//! Wire messages exchanged with upstream and downstream services.
//!
//! All bodies are JSON. Each hop builds a fresh outbound message; only the
//! trace carrier is threaded through, and it is always re-injected from the
//! hop's own span.

use common::{OrderId, OrderStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::trace::TraceCarrier;
use crate::{Result, SagaError};

/// Request to create an order, consumed from `to.order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub username: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<TraceCarrier>,
}

impl CreateOrderRequest {
    pub fn new(username: impl Into<String>, amount: i64) -> Self {
        Self {
            username: username.into(),
            amount,
            trace_parent: None,
        }
    }

    pub fn with_trace_parent(mut self, carrier: TraceCarrier) -> Self {
        self.trace_parent = Some(carrier);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(SagaError::Malformed("username must not be empty".to_string()));
        }
        if self.amount <= 0 {
            return Err(SagaError::Malformed(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Forwarded to `from.order` once the order row exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub username: String,
    pub amount: i64,
    pub order_number: OrderId,
    pub trace_parent: TraceCarrier,
}

/// Request to roll an order back, consumed from `rb.order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub order_number: OrderId,
    /// Status to record; `Unknown` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<TraceCarrier>,
}

impl RollbackRequest {
    pub fn new(order_number: OrderId) -> Self {
        Self {
            order_number,
            status: None,
            trace_parent: None,
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_trace_parent(mut self, carrier: TraceCarrier) -> Self {
        self.trace_parent = Some(carrier);
        self
    }

    /// The status this rollback writes.
    pub fn target_status(&self) -> OrderStatus {
        self.status.unwrap_or(OrderStatus::Unknown)
    }

    /// A rollback never moves an order back to `Processing`.
    fn validate(&self) -> Result<()> {
        let status = self.target_status();
        if !status.is_terminal() {
            return Err(SagaError::Malformed(format!(
                "rollback status must be terminal, got {status}"
            )));
        }
        Ok(())
    }
}

/// Completion report, consumed from `to.order.complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub order_number: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<TraceCarrier>,
}

impl CompleteRequest {
    pub fn new(order_number: OrderId) -> Self {
        Self {
            order_number,
            trace_parent: None,
        }
    }

    pub fn with_trace_parent(mut self, carrier: TraceCarrier) -> Self {
        self.trace_parent = Some(carrier);
        self
    }
}

/// Parses a message body, mapping any decode error to [`SagaError::Malformed`].
pub fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| SagaError::Malformed(e.to_string()))
}

/// Parses and validates a create request.
pub fn parse_create(body: &[u8]) -> Result<CreateOrderRequest> {
    let request: CreateOrderRequest = parse(body)?;
    request.validate()?;
    Ok(request)
}

/// Parses and validates a rollback request.
pub fn parse_rollback(body: &[u8]) -> Result<RollbackRequest> {
    let request: RollbackRequest = parse(body)?;
    request.validate()?;
    Ok(request)
}

/// Pulls whatever trace carrier a body holds, even one that fails to parse
/// as a full message.
pub(crate) fn sniff_trace_parent(body: &[u8]) -> Option<TraceCarrier> {
    #[derive(Deserialize)]
    struct Partial {
        #[serde(default)]
        trace_parent: Option<TraceCarrier>,
    }
    serde_json::from_slice::<Partial>(body)
        .ok()
        .and_then(|p| p.trace_parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_without_trace() {
        let request = parse_create(br#"{"username":"alice","amount":3}"#).unwrap();
        assert_eq!(request, CreateOrderRequest::new("alice", 3));
    }

    #[test]
    fn test_parse_create_rejects_blank_username() {
        let err = parse_create(br#"{"username":"  ","amount":3}"#).unwrap_err();
        assert!(matches!(err, SagaError::Malformed(_)));
    }

    #[test]
    fn test_parse_create_rejects_non_positive_amount() {
        for body in [
            &br#"{"username":"alice","amount":0}"#[..],
            &br#"{"username":"alice","amount":-5}"#[..],
        ] {
            assert!(matches!(parse_create(body), Err(SagaError::Malformed(_))));
        }
    }

    #[test]
    fn test_parse_create_rejects_missing_fields() {
        assert!(matches!(
            parse_create(br#"{"username":"alice"}"#),
            Err(SagaError::Malformed(_))
        ));
        assert!(matches!(parse_create(b"not json"), Err(SagaError::Malformed(_))));
    }

    #[test]
    fn test_rollback_status_defaults_to_unknown() {
        let request: RollbackRequest = parse(br#"{"order_number":7}"#).unwrap();
        assert_eq!(request.order_number, OrderId::new(7));
        assert_eq!(request.target_status(), OrderStatus::Unknown);

        let request: RollbackRequest =
            parse(br#"{"order_number":7,"status":"RolledBack"}"#).unwrap();
        assert_eq!(request.target_status(), OrderStatus::RolledBack);
    }

    #[test]
    fn test_rollback_rejects_unknown_status_string() {
        let result: Result<RollbackRequest> = parse(br#"{"order_number":7,"status":"Lost"}"#);
        assert!(matches!(result, Err(SagaError::Malformed(_))));
    }

    #[test]
    fn test_parse_rollback_rejects_processing_status() {
        let err = parse_rollback(br#"{"order_number":7,"status":"Processing"}"#).unwrap_err();
        assert!(matches!(err, SagaError::Malformed(_)));

        let request = parse_rollback(br#"{"order_number":7,"status":"Success"}"#).unwrap();
        assert_eq!(request.target_status(), OrderStatus::Success);
    }

    #[test]
    fn test_complete_requires_numeric_order_number() {
        let result: Result<CompleteRequest> = parse(br#"{"order_number":"seven"}"#);
        assert!(matches!(result, Err(SagaError::Malformed(_))));
    }

    #[test]
    fn test_order_created_wire_shape() {
        let message = OrderCreated {
            username: "alice".to_string(),
            amount: 3,
            order_number: OrderId::new(1),
            trace_parent: TraceCarrier::default(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "username": "alice",
                "amount": 3,
                "order_number": 1,
                "trace_parent": {}
            })
        );
    }

    #[test]
    fn test_sniff_trace_parent_from_partial_body() {
        let body = br#"{"order_number":"bad","trace_parent":{"traceparent":"00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"}}"#;
        let carrier = sniff_trace_parent(body).unwrap();
        assert!(carrier.header("traceparent").is_some());

        assert!(sniff_trace_parent(b"garbage").is_none());
    }
}
