use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to read configuration file {0}")]
    FailedToRead(String),
    #[error("invalid toml in {file}: {msg}")]
    InvalidToml { file: String, msg: String },
    #[error("configuration has no [index] table")]
    MissingIndex,
}
