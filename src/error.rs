use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("application helper for port {port} already registered")]
    AlreadyExists { port: u16 },

    #[error("unknown TCP state name: {0}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
