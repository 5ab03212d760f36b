//! Queue names and declarations.

use std::time::Duration;

/// Inbound order requests `{username, amount}`.
pub const TO_ORDER: &str = "to.order";

/// Created orders `{username, amount, order_number, trace_parent}`.
pub const FROM_ORDER: &str = "from.order";

/// Rollback requests `{order_number, status?}`.
pub const RB_ORDER: &str = "rb.order";

/// Completion requests `{order_number}`.
pub const TO_ORDER_COMPLETE: &str = "to.order.complete";

/// Verbatim completion bodies whose processing faulted.
pub const RB_DELIVER: &str = "rb.deliver";

/// Exchange that receives expired and rejected messages.
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";

/// Routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY: &str = "dl";

/// Queue bound to the dead-letter exchange.
pub const DEAD_LETTER_QUEUE: &str = "dead.letter";

/// How long an order request may wait in `to.order` before it is dead-lettered.
pub const TO_ORDER_TTL: Duration = Duration::from_millis(1000);

/// Where a queue sends messages that expire or are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
    /// Queue bound to `exchange` under `routing_key`.
    pub queue: String,
}

impl Default for DeadLetter {
    fn default() -> Self {
        Self {
            exchange: DEAD_LETTER_EXCHANGE.to_string(),
            routing_key: DEAD_LETTER_ROUTING_KEY.to_string(),
            queue: DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// Declaration of a single durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub message_ttl: Option<Duration>,
    pub dead_letter: Option<DeadLetter>,
}

impl QueueSpec {
    /// A plain durable queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_ttl: None,
            dead_letter: None,
        }
    }

    /// Expires messages that sit in the queue longer than `ttl`.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Routes expired and rejected messages through `dead_letter`.
    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }
}

/// Every queue the worker reads from or writes to.
pub fn topology() -> Vec<QueueSpec> {
    vec![
        QueueSpec::new(TO_ORDER)
            .with_message_ttl(TO_ORDER_TTL)
            .with_dead_letter(DeadLetter::default()),
        QueueSpec::new(FROM_ORDER),
        QueueSpec::new(RB_ORDER).with_dead_letter(DeadLetter::default()),
        QueueSpec::new(TO_ORDER_COMPLETE).with_dead_letter(DeadLetter::default()),
        QueueSpec::new(RB_DELIVER),
    ]
}
