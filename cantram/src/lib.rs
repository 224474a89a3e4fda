//! Tram protocol and hardware-resource core for modular CAN I/O boards.
//!
//! Boards ("modules") share one CAN bus and talk an addressed
//! request/response protocol. Each module exposes logical I/O channels
//! (interfaces) that are backed either by an exclusively leased on-chip
//! peripheral or by a chip on a shared SPI-style bus.
//!
//! Layers, bottom up:
//!
//! - [`hw_trait`]: peripheral driver traits (CAN, I2C, PWM, UART).
//! - [`resource`]: arena of peripherals with fail-fast leases.
//! - [`chip`]: contracts for SPI-attached chips and the shared chip queue.
//! - [`provider`]: shared output capabilities and the output table.
//! - [`interface`]: logical channels dispatching to their backing.
//! - [`module`]: protocol participants that own interfaces.
//! - [`tram`]: the bus service loop, wire codec and request handle.

pub mod chip;
pub mod config;
pub mod error;
pub mod hw_trait;
pub mod interface;
pub mod module;
pub mod provider;
pub mod resource;
pub mod sim;
pub mod tracing;
pub mod tram;

pub use error::{Error, Result};
