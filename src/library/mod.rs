//! Library transport
//!
//! Moves media between storage slots and drives. Real deployments
//! speak SCSI to a media changer; [`VirtualLibrary`] is a
//! directory-backed stand-in for tests and debugging.

mod virtual_library;
pub use virtual_library::VirtualLibrary;

use lrs_api_types::{DeviceId, MediumId};

/// Transport failures, classified for the health model
///
/// `Unreachable` must leave both drive and medium health untouched;
/// the request is requeued instead.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("library transport unreachable - {0}")]
    Unreachable(String),
    #[error("medium error - {0}")]
    Medium(String),
    #[error("drive error - {0}")]
    Drive(String),
}

/// Interface to the media changer of one library
pub trait MediaTransport: Send {
    /// Library this transport serves.
    fn library(&self) -> &str;

    /// List media labels currently present in the library.
    fn scan(&mut self) -> Result<Vec<String>, TransportError>;

    /// Move `medium` from its storage slot into `drive`.
    ///
    /// The drive must be empty; callers unload first.
    fn load_medium(&mut self, drive: &DeviceId, medium: &MediumId) -> Result<(), TransportError>;

    /// Move `medium` out of `drive` back to a storage slot.
    fn unload_medium(&mut self, drive: &DeviceId, medium: &MediumId)
        -> Result<(), TransportError>;
}
