pub mod sqlite;

use thiserror::Error;

use crate::{core::store::StoreSnapshotV1, op::StoredOp, types::OpSeq};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("uniqueness constraint violated: {0}")]
    Unique(String),
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<rusqlite::Error> for PersistError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Unique(msg.unwrap_or_else(|| err.to_string()))
            }
            other => Self::Sqlite(other),
        }
    }
}

impl From<crate::error::BookingError> for PersistError {
    fn from(value: crate::error::BookingError) -> Self {
        Self::Message(format!("replay error: {value}"))
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

pub trait OpSink: Send {
    fn append_ops(&mut self, ops: &[StoredOp]) -> PersistResult<OpSeq>;
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
    fn write_snapshot(&mut self, _snapshot: &StoreSnapshotV1, _last_seq: OpSeq) -> PersistResult<()> {
        Ok(())
    }
    fn compact_through(&mut self, _seq: OpSeq) -> PersistResult<usize> {
        Ok(0)
    }
}
