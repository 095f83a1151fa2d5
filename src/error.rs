use thiserror::Error;

/// A listing page could not be fetched or decoded.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("invalid listing payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("response carried no data")]
    NoData,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("bad json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row for server {bm_id}: {reason}")]
    Corrupt { bm_id: i64, reason: String },
}

/// Why a single listing item was not posted.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("malformed listing item: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
