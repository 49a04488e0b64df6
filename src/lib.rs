#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB 2.0 host controller driver core
//!
//! This crate is the lowest layer of a USB host stack: it turns one
//! physical root port and a set of hardware DMA channels into ports,
//! pipes and URBs, hiding transfer scheduling, multi-stage control
//! transfers and cache/DMA bookkeeping from the layers above (device
//! enumeration, class drivers, client APIs).
//!
//! # Core Components
//!
//! - [`host::UsbHost`] - the driver object: public API and the interrupt
//!   dispatcher
//! - [`port`] - the root port state machine (power, reset, suspend,
//!   resume, recovery)
//! - [`pipe`] - per-endpoint pipes with the double-buffered transfer
//!   pipeline
//! - [`transfer`] - URBs, setup packets and transfer status
//! - [`hal`] - the register-level contract a platform must implement
//! - [`os`] - the timing/yield contract and internal wait primitives
//! - [`error`] - error types with a strict synchronous/asynchronous split
//!
//! # Integration
//!
//! The platform supplies three things: a [`hal::HostHal`] implementation
//! for its controller, a [`os::HostOs`] implementation for delays and
//! yielding, and a `critical-section` implementation (for example the
//! single-core Cortex-M one). Wire the controller interrupt to
//! [`host::UsbHost::on_interrupt`]; everything else is driven through the
//! port/pipe/URB API.

#[cfg(test)]
extern crate std;

pub mod error;
pub mod hal;
pub mod host;
pub mod os;
pub mod pipe;
pub mod port;
pub mod transfer;

mod buffer;

pub use error::{HcdError, Result};
pub use host::UsbHost;
pub use pipe::{
    EndpointDescriptor, PipeCommand, PipeConfig, PipeEvent, PipeHandle, PipeState,
};
pub use port::{PortCommand, PortConfig, PortEvent, PortState, PortTiming};
pub use transfer::{
    Direction, SetupPacket, TransferStatus, TransferType, Urb, UrbFlags, UrbState, UrbToken,
};
