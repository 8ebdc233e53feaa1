//! Messaging primitives owned by a single consumer.
//!
//! - `credit` - Client credit metering (bounded or unlimited)
//! - `ledger` - Ordered in-flight reference tracking
//! - `transaction` - Ephemeral ack/cancel transaction contexts

pub mod credit;
pub mod ledger;
pub mod transaction;

pub use credit::{CreditEvent, CreditMeter};
pub use ledger::DeliveryLedger;
pub use transaction::{Transaction, TransactionError, TxOperation, TxState};
