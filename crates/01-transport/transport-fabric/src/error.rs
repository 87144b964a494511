use std::io;

use thiserror::Error;

use transport::TransportError;

pub type FabricResult<T> = Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("ring still full after {attempts} attempts")]
    BackPressured { attempts: usize },

    #[error("invalid fabric configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn agent thread: {0}")]
    Spawn(#[source] io::Error),
}

impl FabricError {
    pub fn codec(msg: impl Into<String>) -> Self {
        FabricError::Codec(msg.into())
    }
}
