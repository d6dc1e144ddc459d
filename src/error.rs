use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogUnitError {
    #[error("failed to read file")]
    FailedToRead,
    #[error("invalid toml")]
    InvalidToml,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("a file-backed unit needs a work directory")]
    MissingWorkDirectory,

    #[error("metadata tag {0} is reserved")]
    ReservedMetadataTag(u8),
}
