use rayon::ThreadPoolBuildError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Kv(#[from] redb::Error),
    #[error("could not encode: {0}")]
    Encode(#[from] rmps::encode::Error),
    #[error("could not decode: {0}")]
    Decode(#[from] rmps::decode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not build thread pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("corrupt data: {0}")]
    CorruptData(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("trie node too large: {0}")]
    TrieFull(String),
    #[error("too many requests")]
    TooManyRequests,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("shard {shard} failed: {error}")]
    ShardFailed { shard: usize, error: Box<Error> },
    #[error("{} shards failed", .0.len())]
    ShardsFailed(Vec<Error>),
}

impl Error {
    pub fn corrupt<S: Into<String>>(msg: S) -> Error {
        Error::CorruptData(msg.into())
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidInput(msg.into())
    }
}

macro_rules! kv_error {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Error {
                fn from(e: $t) -> Self {
                    Error::Kv(e.into())
                }
            }
        )*
    };
}

kv_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
