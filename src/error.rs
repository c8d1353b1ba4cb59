//! Error handling for this crate

/// The error type of this crate
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The source is already registered with an event loop and cannot be
    /// started a second time before being stopped.
    #[error("source is already started on an event loop")]
    AlreadyStarted,

    /// The backend does not implement the requested operation.
    #[error("operation is not supported by this backend")]
    Unsupported,

    /// An underlying IO error
    #[error("underlying IO error")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Into::<std::io::Error>::into(err).into()
    }
}

/// The result type of this crate
pub type Result<T> = core::result::Result<T, Error>;
