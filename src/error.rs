//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to encode or decode bencoded bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// Indicates that a byte slice of the wrong length was used as an [crate::Id].
    #[error("Invalid id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a string could not be decoded as a hex-encoded [crate::Id].
    #[error("Invalid id encoding: {0}")]
    InvalidIdEncoding(String),

    /// An engine for this address family is already registered in the sibling set.
    #[error("An engine for the {0} family is already registered")]
    FamilyTaken(crate::common::AddressFamily),

    /// The engine was asked to do something that requires it to be running.
    #[error("Engine is not running")]
    NotRunning,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
