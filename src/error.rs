//! Error types shared by the store, synchronizer and promotion code.

use thiserror::Error;
use uuid::Uuid;

use crate::models::CounterFailure;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A tenant-scoped row that the caller referenced does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Log removals committed but the following insert did not. The removed
    /// students' counters were still rolled back; `failures` lists the ones
    /// that could not be.
    #[error("Attendance insert failed after {} removal(s) were committed: {source}", .removed.len())]
    PartialLogWrite {
        source: Box<Error>,
        removed: Vec<Uuid>,
        failures: Vec<CounterFailure>,
    },
}
