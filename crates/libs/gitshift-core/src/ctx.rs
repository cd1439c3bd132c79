//! Initiator context for audit logging.
//!
//! [`Ctx`] identifies who asked for an operation. Migration logs record the
//! initiator verbatim in their `initiated_by` column; scheduler-internal
//! work runs under [`Ctx::system`].

/// Request context carrying the initiator identity.
#[derive(Clone, Debug)]
pub struct Ctx {
    initiator: String,
}

impl Ctx {
    /// Context for scheduler-internal and maintenance operations.
    pub fn system() -> Self {
        Ctx {
            initiator: "system".to_string(),
        }
    }

    /// Context for an operator-initiated request.
    pub fn operator(initiator: impl Into<String>) -> Self {
        Ctx {
            initiator: initiator.into(),
        }
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }
}
