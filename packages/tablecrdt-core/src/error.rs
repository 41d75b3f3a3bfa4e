use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("store error: {0}")]
    Store(String),
}
