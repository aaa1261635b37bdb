//! Transaction fields in requests.

use super::Transaction;
use crate::{
    codec::RequestBuffer,
    error::{ProxyError, Result},
    protocol::NO_TRANSACTION,
};

/// Fail with a usage error when `transaction` can no longer take work.
pub(crate) fn ensure_valid(transaction: Option<&Transaction>) -> Result<()> {
    match transaction {
        Some(transaction) if !transaction.is_valid() => Err(ProxyError::incorrect_call(
            "the transaction has completed or is not enlisted",
        )),
        _ => Ok(()),
    }
}

/// Write the transaction field of a request.
///
/// Without a transaction a single zero is written. Otherwise the encoding
/// depends on whether the peer requires optimized transactions; the first
/// optimized write of a unit of work also marks its server-side
/// transaction as created.
pub(crate) fn put_transaction(
    request: &mut RequestBuffer,
    transaction: Option<&Transaction>,
) -> Result<()> {
    match transaction {
        None => {
            request.put_i32(NO_TRANSACTION);
            Ok(())
        }
        Some(Transaction::Local(transaction)) => {
            transaction.encode(request);
            Ok(())
        }
        Some(Transaction::Xa(resource)) => resource.encode(request),
    }
}
