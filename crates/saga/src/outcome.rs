//! What each handler did with a message.

use std::time::Duration;

use common::{OrderId, OrderStatus};

use crate::options::CreateFailurePolicy;

/// How the worker settles the inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the broker forgets the message.
    Ack,
    /// Reject without requeue; the queue's dead-letter route applies.
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Reject => "reject",
        }
    }
}

/// The create step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    Begin,
    Insert,
    /// Commit failed after `OrderCreated` was already published.
    Commit,
}

impl CreateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreateStage::Begin => "begin",
            CreateStage::Insert => "insert",
            CreateStage::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Row committed and `OrderCreated` published.
    Forwarded { order_id: OrderId },
    /// Body unparseable or invalid; nothing was written.
    Malformed { reason: String },
    /// A store step failed; the transaction was not committed.
    Failed { stage: CreateStage, reason: String },
    /// The deadline ran out; the in-flight transaction was rolled back.
    ///
    /// `after_publish` is set when the deadline hit once the publish to
    /// `from.order` had started: `OrderCreated` may already be downstream
    /// even though no row was committed.
    DeadlineExceeded {
        deadline: Duration,
        after_publish: bool,
    },
}

impl CreateOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, CreateOutcome::Forwarded { .. })
    }

    /// Settles the delivery: forwarded requests are acked, the rest follow
    /// `policy`.
    pub fn disposition(&self, policy: CreateFailurePolicy) -> Disposition {
        match (self, policy) {
            (CreateOutcome::Forwarded { .. }, _) => Disposition::Ack,
            (_, CreateFailurePolicy::Drop) => Disposition::Ack,
            (_, CreateFailurePolicy::DeadLetter) => Disposition::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Updated {
        order_id: OrderId,
        status: OrderStatus,
        previous: OrderStatus,
    },
    /// The guard kept the row's terminal status.
    Skipped {
        order_id: OrderId,
        current: OrderStatus,
    },
    NotFound { order_id: OrderId },
}

/// Why a completion could not be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultReason {
    Malformed(String),
    Store(String),
    NotFound(OrderId),
    /// The guard refused to overwrite a terminal status other than `Success`.
    Terminal { order_id: OrderId, current: OrderStatus },
}

impl FaultReason {
    /// Short label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FaultReason::Malformed(_) => "malformed",
            FaultReason::Store(_) => "store",
            FaultReason::NotFound(_) => "not_found",
            FaultReason::Terminal { .. } => "terminal",
        }
    }
}

impl std::fmt::Display for FaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultReason::Malformed(reason) => write!(f, "malformed message: {reason}"),
            FaultReason::Store(reason) => write!(f, "store failure: {reason}"),
            FaultReason::NotFound(id) => write!(f, "order {id} not found"),
            FaultReason::Terminal { order_id, current } => {
                write!(f, "order {order_id} is already {current}")
            }
        }
    }
}

/// Result of the primary completion path, before any compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Success(OrderId),
    Fault(FaultReason),
}

/// Final result of a completion message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Completed(OrderId),
    /// The original body went to the delivery-failure queue. `traced` is
    /// false when the body was unparseable and went out without trace headers.
    Compensated { reason: FaultReason, traced: bool },
}
