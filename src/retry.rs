//! Retry policies and error classification.
//!
//! Storage calls retry transient failures under an exponential envelope
//! (1 s initial, x2, capped at 5 s, 10 s overall deadline).  Non-retriable
//! SQL errors short-circuit as `backoff::Error::Permanent` so the caller
//! fails fast instead of burning the deadline.

use std::time::Duration;

use backoff::ExponentialBackoff;

pub fn storage_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        multiplier: 2.0,
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(10)),
        ..ExponentialBackoff::default()
    }
}

/// Outbound-send envelope.  Waits are unjittered at 1 s then 2 s under a
/// 4 s elapsed-time deadline, so a failing send gets attempts at t=0, 1
/// and 3 seconds before giving up.
pub fn send_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        multiplier: 2.0,
        max_interval: Duration::from_secs(2),
        max_elapsed_time: Some(Duration::from_secs(4)),
        randomization_factor: 0.0,
        ..ExponentialBackoff::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retriable,
    Permanent,
}

/// SQLSTATE-based classification.  Connection trouble, serialization
/// conflicts, deadlocks and resource exhaustion are worth retrying;
/// constraint and syntax errors never heal on their own.
pub fn classify_sqlstate(code: &str) -> RetryClass {
    if code.starts_with("08") || code.starts_with("53") {
        return RetryClass::Retriable;
    }
    match code {
        "40001" | "40P01" | "57P03" => RetryClass::Retriable,
        _ => RetryClass::Permanent,
    }
}

pub fn classify_sql_error(err: &sqlx::Error) -> RetryClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => RetryClass::Retriable,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(&code),
            None => RetryClass::Permanent,
        },
        _ => RetryClass::Permanent,
    }
}

/// Adapter for `backoff::future::retry` operations over sqlx calls.
pub fn to_backoff(err: sqlx::Error) -> backoff::Error<sqlx::Error> {
    match classify_sql_error(&err) {
        RetryClass::Retriable => backoff::Error::transient(err),
        RetryClass::Permanent => backoff::Error::permanent(err),
    }
}
