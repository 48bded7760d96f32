//! Error types for crucible-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrucibleError {
    #[error("staging error: {0}")]
    Stage(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("status record error: {0}")]
    Status(String),

    #[error("language registry error: {0}")]
    Languages(String),

    #[error("configuration error: {0}")]
    Config(String),
}
