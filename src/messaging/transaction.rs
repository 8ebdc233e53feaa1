use thiserror::Error;

/// Transaction state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Operations are being collected.
    Active,
    /// A failure occurred; only rollback may complete the transaction.
    RollbackOnly,
    /// Terminal: operations ran their commit side effects.
    Committed,
    /// Terminal: operations ran their rollback side effects.
    RolledBack,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::RollbackOnly => "rollback_only",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

/// A deferred side effect attached to a transaction.
///
/// Acknowledgements take effect at commit; queue cancellations take effect at
/// rollback, which is how close uses an ephemeral rolled-back transaction as
/// a cancellation context.
pub trait TxOperation: Send {
    fn after_commit(&mut self) {}

    fn after_rollback(&mut self) {}
}

/// Transaction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction is rollback-only: {0}")]
    RollbackOnly(String),

    #[error("transaction already {0}")]
    Terminal(&'static str),
}

/// Ephemeral transaction context for acknowledge and cancel batches.
pub struct Transaction {
    state: TxState,
    rollback_reason: Option<String>,
    operations: Vec<Box<dyn TxOperation>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            state: TxState::Active,
            rollback_reason: None,
            operations: Vec::new(),
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn rollback_reason(&self) -> Option<&str> {
        self.rollback_reason.as_deref()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn add_operation(&mut self, operation: Box<dyn TxOperation>) {
        self.operations.push(operation);
    }

    /// Flag the transaction so a later commit fails. First reason wins.
    pub fn mark_rollback_only(&mut self, reason: impl Into<String>) {
        if self.state == TxState::Active {
            self.state = TxState::RollbackOnly;
        }
        if self.rollback_reason.is_none() {
            self.rollback_reason = Some(reason.into());
        }
    }

    pub fn commit(&mut self) -> Result<(), TransactionError> {
        match self.state {
            TxState::Active => {
                self.state = TxState::Committed;
                for operation in &mut self.operations {
                    operation.after_commit();
                }
                Ok(())
            }
            TxState::RollbackOnly => Err(TransactionError::RollbackOnly(
                self.rollback_reason
                    .clone()
                    .unwrap_or_else(|| "unspecified".to_string()),
            )),
            state => Err(TransactionError::Terminal(state.as_str())),
        }
    }

    pub fn rollback(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TxState::RolledBack;
        for operation in &mut self.operations {
            operation.after_rollback();
        }
    }
}
