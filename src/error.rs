use thiserror::Error;

/// Errors exchanged between the core and filter callbacks.
///
/// `configure_pid` implementations return these to steer the connection
/// lifecycle: `RequiresNewInstance` asks the core to clone the filter,
/// any other error triggers blacklisting and chain rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation not supported")]
    NotSupported,
    #[error("bad parameter")]
    BadParam,
    #[error("filter not found")]
    FilterNotFound,
    #[error("out of memory")]
    OutOfMem,
    #[error("service error")]
    ServiceError,
    #[error("filter requires a new instance")]
    RequiresNewInstance,
    #[error("pid not connected")]
    NotConnected,
    #[error("end of stream")]
    Eos,
}

pub type Result<T> = std::result::Result<T, Error>;
