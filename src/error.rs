use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: balance={balance} required={required} shortfall={shortfall}")]
    InsufficientFunds {
        balance: u64,
        required: u64,
        shortfall: u64,
    },
    #[error("balance row lock timed out")]
    LockTimeout,
    #[error("ledger transaction timed out after {elapsed_ms}ms")]
    TransactionTimeout { elapsed_ms: u64 },
    #[error("deduction not found: {deduction_id}")]
    DeductionNotFound { deduction_id: i64 },
    #[error("data integrity violation for user {user_id}: {detail}")]
    DataIntegrity { user_id: String, detail: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        // SQLITE_BUSY means the bounded busy_timeout wait on the balance
        // writer lock elapsed; callers treat that as retryable.
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return LedgerError::LockTimeout;
            }
        }
        LedgerError::Sqlite(err)
    }
}

impl LedgerError {
    /// Whether the caller may safely retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::LockTimeout | LedgerError::TransactionTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
