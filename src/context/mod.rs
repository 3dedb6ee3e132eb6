//! Per-operation context
//!
//! Every broker entry point creates an `OpContext` and threads it through the
//! work it starts, including background tasks. Its span carries the
//! correlation id so log lines from one request can be followed across the
//! scheduler, router and store.

use std::fmt;

use tracing::Span;
use uuid::Uuid;

use crate::cluster::ClusterId;

/// Broker entry point an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Provision,
    Update,
    Deprovision,
    Recreate,
    LastOperation,
    Bind,
    Unbind,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Provision => "provision",
            Operation::Update => "update",
            Operation::Deprovision => "deprovision",
            Operation::Recreate => "recreate",
            Operation::LastOperation => "last-operation",
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct OpContext {
    pub correlation_id: Uuid,
    pub instance_id: ClusterId,
    pub operation: Operation,
}

impl OpContext {
    pub fn new(operation: Operation, instance_id: ClusterId) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            instance_id,
            operation,
        }
    }

    /// Span to instrument the operation's futures with
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "op",
            op = %self.operation,
            instance = %self.instance_id,
            correlation = %self.correlation_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_get_distinct_correlation_ids() {
        let a = OpContext::new(Operation::Provision, ClusterId::from("i"));
        let b = OpContext::new(Operation::Provision, ClusterId::from("i"));
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_eq!(a.operation.to_string(), "provision");
    }
}
