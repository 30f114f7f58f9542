//! Session error taxonomy

use thiserror::Error;

/// Errors surfaced by client and server sessions.
///
/// Lifecycle errors (`NotConnected`, `NotListening`, `AlreadyConnected`,
/// `AlreadyListening`) leave the session untouched. Establishment errors
/// (`Connect`, `Bind`, `Accept`) also leave it untouched so the caller may
/// retry. `Close` is reported after local state has already been released.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No association established")]
    NotConnected,
    #[error("Listener not started")]
    NotListening,
    #[error("Association already established")]
    AlreadyConnected,
    #[error("Listener already started")]
    AlreadyListening,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Bind failed: {0}")]
    Bind(String),
    #[error("Accept failed: {0}")]
    Accept(String),
    #[error("Transmit failed: {0}")]
    Transmit(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Message of {size} bytes exceeds receive capacity of {capacity} bytes")]
    MessageTooLarge { size: usize, capacity: usize },
    #[error("Close failed: {0}")]
    Close(String),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
