//! ACID transaction helpers

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::errors::{Result, TapeError};

/// Execute `operation` within a transaction.
///
/// Commits when the closure returns `Ok`; on `Err` the transaction is dropped,
/// which rolls it back. Writers use [`TransactionBehavior::Immediate`] so the
/// write lock is taken up front and contention surfaces as `Busy` at `BEGIN`
/// rather than mid-way through the operation.
///
/// # Example
/// ```rust,no_run
/// # use tape_store::db::execute_in_transaction;
/// # use rusqlite::{Connection, TransactionBehavior};
/// # fn example(conn: &mut Connection) -> tape_store::Result<()> {
/// execute_in_transaction(conn, TransactionBehavior::Immediate, |tx| {
///     tx.execute("UPDATE tapes SET archived_at = NULL", [])?;
///     Ok(())
/// })?;
/// # Ok(())
/// # }
/// ```
pub fn execute_in_transaction<F, T>(
    conn: &mut Connection,
    behavior: TransactionBehavior,
    operation: F,
) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn
        .transaction_with_behavior(behavior)
        .map_err(|e| TapeError::from_sqlite("failed to begin transaction", e))?;

    let result = operation(&tx)?;

    tx.commit()
        .map_err(|e| TapeError::from_sqlite("failed to commit transaction", e))?;
    Ok(result)
}
