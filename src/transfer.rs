//! USB transfer vocabulary and the URB (USB request block) object
//!
//! URBs move by value: the caller builds one around its own data buffer,
//! hands it to [`UsbHost::urb_enqueue`], and receives it back from
//! [`UsbHost::urb_dequeue`] once retired. The driver never frees or
//! reallocates the data buffer.
//!
//! [`UsbHost::urb_enqueue`]: crate::host::UsbHost::urb_enqueue
//! [`UsbHost::urb_dequeue`]: crate::host::UsbHost::urb_dequeue

use bitflags::bitflags;
use heapless::Vec;

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Transfer direction, host-relative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    In,
    Out,
}

/// Endpoint address byte: endpoint number plus direction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    const DIR_MASK: u8 = 0x80;

    /// Build an address from an endpoint number and direction
    pub const fn new(number: u8, direction: Direction) -> Self {
        let dir_bit = match direction {
            Direction::In => Self::DIR_MASK,
            Direction::Out => 0,
        };
        Self((number & 0x0F) | dir_bit)
    }

    /// Address of the default control endpoint (EP0)
    pub const fn control() -> Self {
        Self(0)
    }

    /// Endpoint number without the direction bit
    pub const fn number(self) -> u8 {
        self.0 & 0x0F
    }

    /// Transfer direction encoded in the address
    pub const fn direction(self) -> Direction {
        if self.0 & Self::DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Raw address byte
    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Size of a control transfer setup packet in bytes
pub const SETUP_PACKET_SIZE: usize = 8;

/// USB setup packet for control transfers
///
/// A control URB's data buffer starts with the 8 setup bytes, followed by
/// the data stage buffer (if any).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Create GET_DESCRIPTOR request
    pub fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device-to-host, standard, device
            request: 0x06,      // GET_DESCRIPTOR
            value: ((desc_type as u16) << 8) | (desc_index as u16),
            index: language_id,
            length,
        }
    }

    /// Create SET_ADDRESS request
    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00, // Host-to-device, standard, device
            request: 0x05,      // SET_ADDRESS
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    /// Create SET_CONFIGURATION request
    pub fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: 0x00, // Host-to-device, standard, device
            request: 0x09,      // SET_CONFIGURATION
            value: configuration as u16,
            index: 0,
            length: 0,
        }
    }

    /// Check if the data stage (and the request) is device-to-host
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Decode the first [`SETUP_PACKET_SIZE`] bytes of a control buffer
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Serialize into the first [`SETUP_PACKET_SIZE`] bytes of a buffer
    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&self.value.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.index.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.length.to_le_bytes());
    }
}

/// Final status of a retired URB (or of one isochronous packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferStatus {
    /// Transfer completed (possibly short for IN transfers)
    Completed,
    /// Excessive transaction errors on the bus
    Error,
    /// Transfer was canceled by a halt/flush or abort
    Canceled,
    /// Endpoint returned a protocol STALL
    Stall,
    /// Device sent more data than requested (babble)
    Overflow,
    /// Isochronous packet's scheduled frame was never serviced
    Skipped,
    /// Device was disconnected before the transfer ran
    NoDevice,
}

bitflags! {
    /// Caller-set URB request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UrbFlags: u8 {
        /// Terminate an OUT transfer whose length is an exact multiple of
        /// the endpoint's MPS with an extra zero length packet
        const ZERO_PACKET = 1 << 0;
    }
}

/// URB lifecycle tag
///
/// The observed sequence for any URB is a subsequence of
/// IDLE → PENDING → INFLIGHT → DONE → IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UrbState {
    /// Held by the caller, not enqueued anywhere
    Idle,
    /// Enqueued on a pipe, awaiting a buffer
    Pending,
    /// Bound into a buffer that is filled or executing
    InFlight,
    /// Retired, waiting in the done queue to be dequeued
    Done,
}

/// Opaque identifier stamped on an URB at enqueue, used to abort it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UrbToken(pub(crate) u32);

/// Maximum isochronous packets per URB (bounded by the descriptor list)
pub const ISOC_PACKETS_MAX: usize = crate::hal::FRAME_LIST_LEN;

/// One isochronous packet of an URB, with its own result
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsocPacket {
    /// Requested packet length in bytes
    pub num_bytes: usize,
    pub(crate) actual_num_bytes: usize,
    pub(crate) status: Option<TransferStatus>,
}

impl IsocPacket {
    /// Bytes actually transferred for this packet
    pub fn actual_num_bytes(&self) -> usize {
        self.actual_num_bytes
    }

    /// Per-packet completion status, `None` until the URB is retired
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }
}

/// A USB request block: one transfer submitted to a pipe
///
/// The data buffer is borrowed for `'static` from the caller; ownership of
/// its memory never transfers to the driver. For control transfers the
/// buffer holds the setup packet in its first 8 bytes and the data stage
/// after it, and `num_bytes` covers both.
pub struct Urb {
    data: &'static mut [u8],
    num_bytes: usize,
    pub(crate) actual_num_bytes: usize,
    pub(crate) status: Option<TransferStatus>,
    pub(crate) flags: UrbFlags,
    pub(crate) isoc_packets: Vec<IsocPacket, ISOC_PACKETS_MAX>,
    pub(crate) state: UrbState,
    pub(crate) token: UrbToken,
}

impl core::fmt::Debug for Urb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Urb")
            .field("num_bytes", &self.num_bytes)
            .field("actual_num_bytes", &self.actual_num_bytes)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Urb {
    /// Build an URB transferring the first `num_bytes` of `data`
    ///
    /// Returns `None` if `num_bytes` exceeds the buffer length.
    pub fn new(data: &'static mut [u8], num_bytes: usize) -> Option<Self> {
        if num_bytes > data.len() {
            return None;
        }
        Some(Self {
            data,
            num_bytes,
            actual_num_bytes: 0,
            status: None,
            flags: UrbFlags::empty(),
            isoc_packets: Vec::new(),
            state: UrbState::Idle,
            token: UrbToken(0),
        })
    }

    /// Set request flags (builder style)
    pub fn with_flags(mut self, flags: UrbFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Append an isochronous packet of `num_bytes`
    ///
    /// Fails once [`ISOC_PACKETS_MAX`] packets have been added.
    pub fn push_isoc_packet(&mut self, num_bytes: usize) -> crate::error::Result<()> {
        self.isoc_packets
            .push(IsocPacket {
                num_bytes,
                actual_num_bytes: 0,
                status: None,
            })
            .map_err(|_| crate::error::HcdError::NoResources)
    }

    /// Requested transfer length in bytes
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// Bytes actually transferred, valid once the URB is retired
    pub fn actual_num_bytes(&self) -> usize {
        self.actual_num_bytes
    }

    /// Completion status, `None` until the URB is retired
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    /// Current lifecycle tag
    pub fn state(&self) -> UrbState {
        self.state
    }

    /// Isochronous packet results
    pub fn isoc_packets(&self) -> &[IsocPacket] {
        &self.isoc_packets
    }

    /// Data buffer contents
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Mutable data buffer access
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Consume the URB and recover the caller's buffer
    pub fn into_data(self) -> &'static mut [u8] {
        self.data
    }

    pub(crate) fn data_ptr(&mut self, offset: usize) -> core::ptr::NonNull<u8> {
        // Offset is validated against num_bytes <= data.len() at build time
        let slice = &mut self.data[offset..];
        core::ptr::NonNull::new(slice.as_mut_ptr()).unwrap_or(core::ptr::NonNull::dangling())
    }
}
