//! Common error types for cantram.
//!
//! This module provides the crate-wide Error enum using thiserror, carrying
//! the bus-level failure taxonomy, with conversions from the error types of
//! the lower layers.

use thiserror::Error;

use crate::chip::ChipError;
use crate::hw_trait::HwError;
use crate::interface::InterfaceError;
use crate::provider::ProviderError;
use crate::resource::ResourceError;
use crate::tram::{Address, Status};

/// Main error type for cantram operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Peripheral already leased by another owner
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// No response within the request deadline
    #[error("Timeout waiting for module {address} (tag {tag})")]
    Timeout { address: Address, tag: u8 },

    /// Two boards claim the same address, or the target is taken
    #[error("Duplicate address {0}")]
    DuplicateAddress(Address),

    /// Operation is not valid for the channel kind
    #[error("Operation unsupported by module {address} channel {channel}")]
    Unsupported { address: Address, channel: u8 },

    /// Diagnostic-flagged hardware fault on the remote channel
    #[error("Channel {channel} of module {address} is faulted")]
    FaultedChannel { address: Address, channel: u8 },

    /// Frame failed the format or checksum checks
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Address absent from the directory
    #[error("Unknown module {0}")]
    UnknownModule(Address),

    /// Too many requests queued for one address
    #[error("Module {0} is busy")]
    Busy(Address),

    /// Request cancelled by the caller
    #[error("Request to module {0} cancelled")]
    Cancelled(Address),

    /// Remote module answered with an error status
    #[error("Module {address} rejected request: {status}")]
    Rejected { address: Address, status: Status },

    /// Local interface errors
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    /// Output provider errors
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// SPI chip errors
    #[error(transparent)]
    Chip(#[from] ChipError),

    /// Hardware communication errors
    #[error(transparent)]
    Hardware(#[from] HwError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed configuration file
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The bus service loop is gone
    #[error("Bus service stopped")]
    Stopped,
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
