//! Driver error types

use core::fmt;

/// Driver operation result type
pub type Result<T> = core::result::Result<T, HcdError>;

/// Errors returned synchronously by port, pipe and URB operations.
///
/// USB transport failures (stall, babble, transaction errors) are never
/// reported through this type; they surface as a [`TransferStatus`] on the
/// completed URB instead.
///
/// [`TransferStatus`]: crate::transfer::TransferStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HcdError {
    /// An argument was out of range or malformed
    InvalidArgument,
    /// The operation is not legal in the current port/pipe/URB state
    InvalidState,
    /// A blocking command observed the state change underneath it
    /// (e.g. the device disconnected mid-reset); the command did not
    /// complete but the failure was not the command's own
    CommandInvalidated,
    /// No hardware channel, queue slot or buffer was available
    NoResources,
    /// The configuration is not supported by this port or controller
    Unsupported,
    /// No port with the requested number exists
    NotFound,
    /// The referenced URB is not held by this pipe
    UrbNotFound,
    /// The transfer does not fit the pipe's descriptor list
    TransferTooLarge,
    /// The driver (or this port) is already initialized
    AlreadyInitialized,
}

impl fmt::Display for HcdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::InvalidState => write!(f, "Invalid state for operation"),
            Self::CommandInvalidated => write!(f, "Command invalidated by concurrent state change"),
            Self::NoResources => write!(f, "No resources available"),
            Self::Unsupported => write!(f, "Unsupported configuration"),
            Self::NotFound => write!(f, "Port not found"),
            Self::UrbNotFound => write!(f, "URB not found"),
            Self::TransferTooLarge => write!(f, "Transfer exceeds descriptor list"),
            Self::AlreadyInitialized => write!(f, "Already initialized"),
        }
    }
}
