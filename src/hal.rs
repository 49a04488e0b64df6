//! Platform HAL contract
//!
//! The driver core is hardware-agnostic: everything that touches a register
//! goes through [`HostHal`]. A platform crate implements the trait for its
//! controller; the associated [`HostHal::Desc`] type is the controller's
//! in-memory transfer descriptor, opaque to the core, which only ever fills,
//! clears and parses descriptors through the trait.
//!
//! Channels are named by [`ChannelId`], an opaque index handed out by
//! [`HostHal::channel_alloc`]. The core keeps its own channel-to-pipe table;
//! no context pointers cross the hardware/software boundary.

use crate::transfer::{Direction, TransferType};
use bitflags::bitflags;
use core::ptr::NonNull;

/// Periodic frame list length in schedule slots
///
/// Matches the transfer descriptor list length for periodic pipes so that
/// one descriptor corresponds to one (micro)frame slot. Must be a power of
/// two.
pub const FRAME_LIST_LEN: usize = 32;

/// The periodic schedule's frame list, installed into the controller after
/// a successful port reset
///
/// Slot contents are maintained by the HAL as periodic channels come and
/// go; the core only zeroes the list on init/recovery and installs it.
#[repr(C, align(512))]
pub struct FrameList(pub [u32; FRAME_LIST_LEN]);

impl FrameList {
    /// A cleared frame list
    pub const fn new() -> Self {
        Self([0; FRAME_LIST_LEN])
    }

    /// Zero every schedule slot
    pub fn clear(&mut self) {
        self.0 = [0; FRAME_LIST_LEN];
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiated device/bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Speed {
    Low,
    Full,
    High,
}

/// FIFO sizing bias for the controller's shared FIFO memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FifoBias {
    /// Balanced RX/TX sizing
    Balanced,
    /// Bias towards the receive FIFO
    Rx,
    /// Bias towards the periodic transmit FIFO
    PeriodicTx,
}

/// Largest supported MPS per FIFO, derived from the current bias
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MpsLimits {
    /// Limit for IN endpoints
    pub in_mps: u16,
    /// Limit for control/bulk OUT endpoints
    pub non_periodic_out_mps: u16,
    /// Limit for interrupt/isochronous OUT endpoints
    pub periodic_out_mps: u16,
}

/// Opaque hardware channel index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub u8);

/// Endpoint characteristics programmed into a channel
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointCharacteristics {
    /// Transfer type serviced by the channel
    pub transfer_type: TransferType,
    /// Endpoint address (number + direction)
    pub address: crate::transfer::EndpointAddress,
    /// Maximum packet size
    pub mps: u16,
    /// Target device address
    pub device_address: u8,
    /// Low-speed device reached through a full-speed hub
    pub ls_via_fs_hub: bool,
    /// Periodic scheduling parameters (interrupt/isochronous only)
    pub periodic: PeriodicCharacteristics,
}

/// Periodic scheduling parameters
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeriodicCharacteristics {
    /// Service interval in (micro)frames; 0 for non-periodic endpoints
    pub interval: u16,
    /// Phase offset of this endpoint within its interval
    pub offset: u16,
    /// Endpoint belongs to a high-speed device
    pub is_high_speed: bool,
}

impl PeriodicCharacteristics {
    /// Parameters for a non-periodic endpoint
    pub const fn none() -> Self {
        Self {
            interval: 0,
            offset: 0,
            is_high_speed: false,
        }
    }
}

/// Port-level signal decoded from the controller's interrupt status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSignal {
    /// A device connection was detected
    Connect,
    /// The device was disconnected
    Disconnect,
    /// The port finished enabling after reset
    Enabled,
    /// The port was disabled (by request or by a port error)
    Disabled,
    /// An overcurrent condition was detected
    Overcurrent,
    /// The overcurrent condition cleared
    OvercurrentCleared,
}

/// Top-level interrupt classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CoreInterrupt {
    /// Nothing pending
    None,
    /// One or more channels have pending interrupts
    Channel,
    /// A port-level event
    Port(PortSignal),
}

/// Event decoded from a single channel's interrupt status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelEvent {
    /// The active descriptor list ran to completion (or stopped early on a
    /// short packet)
    Completed,
    /// The channel halted on an error; see [`HostHal::channel_error`]
    Error,
    /// The halt requested via [`HostHal::channel_request_halt`] completed
    HaltAcknowledged,
    /// Spurious; nothing to do
    None,
}

/// Error cause of a [`ChannelEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError {
    /// Excessive transaction errors (CRC, timeout, bad PID)
    Transaction,
    /// The channel needed a descriptor that was not available
    BufferNotAvailable,
    /// Packet babble: the device sent more than the descriptor allowed
    Babble,
    /// The endpoint returned STALL
    Stall,
}

/// Data toggle PID programmed for the next control stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataPid {
    Data0,
    Data1,
}

bitflags! {
    /// Transfer descriptor fill flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u8 {
        /// Descriptor carries a SETUP token
        const SETUP = 1 << 0;
        /// Descriptor transfers device-to-host
        const IN = 1 << 1;
        /// Halt the channel on completion of this descriptor (set on the
        /// final descriptor of a transfer)
        const HALT_ON_COMPLETE = 1 << 2;
    }
}

/// Completion status of one parsed descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DescStatus {
    /// Descriptor executed successfully
    Success,
    /// Descriptor's scheduled slot was never serviced
    NotExecuted,
    /// Descriptor stopped on an error
    Error,
}

/// Result of parsing one completed descriptor
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DescResult {
    /// Bytes of the descriptor's requested length left untransferred
    pub remaining: usize,
    /// Per-descriptor completion status
    pub status: DescStatus,
}

/// Direction of a cache/DMA synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncDirection {
    /// Software wrote the region; make it visible to the controller
    ToDevice,
    /// The controller wrote the region; make it visible to software
    FromDevice,
}

/// Register-level operations the platform must provide
///
/// All methods are called with the driver's critical section held unless
/// noted otherwise; implementations must not block.
pub trait HostHal {
    /// The controller's in-memory transfer descriptor
    type Desc: Copy + Default;

    // ---- Core ----

    /// Initialize controller-global registers (host mode, interrupt masks)
    fn core_init(&mut self);
    /// Undo [`HostHal::core_init`]
    fn core_deinit(&mut self);
    /// Full controller soft reset; wipes all registers
    fn core_soft_reset(&mut self);
    /// Gate delivery of the controller interrupt
    fn interrupt_enable(&mut self, enabled: bool);

    // ---- Port registers ----

    /// Initialize host port registers
    fn port_init(&mut self);
    /// Undo [`HostHal::port_init`]
    fn port_deinit(&mut self);
    /// Drive port power on or off
    fn port_set_power(&mut self, on: bool);
    /// Assert or release the bus reset signal
    fn port_assert_reset(&mut self, asserted: bool);
    /// Assert or release the resume (K state) signal
    fn port_assert_resume(&mut self, asserted: bool);
    /// Stop SOF/keep-alive generation
    fn port_suspend(&mut self);
    /// Request port disable; completion arrives as [`PortSignal::Disabled`]
    fn port_disable(&mut self);
    /// Finish host port register setup after a [`PortSignal::Enabled`]
    fn port_enable(&mut self);
    /// Speed negotiated with the connected device
    fn port_speed(&self) -> Speed;
    /// Sample the physical connection state
    fn port_connected(&self) -> bool;
    /// Re-arm connection change detection after a debounce re-sample
    fn port_clear_debounce_lock(&mut self);
    /// Reconfigure the controller's FIFO sizing
    fn set_fifo_bias(&mut self, bias: FifoBias);
    /// Install the periodic frame list base address
    fn install_frame_list(&mut self, frame_list: &FrameList);
    /// Enable periodic schedule processing
    fn periodic_enable(&mut self);
    /// Current frame number, wrapped to the frame list length
    fn frame_number(&self) -> u16;
    /// Time remaining in the current (micro)frame, in PHY clocks
    fn frame_time_remaining(&self) -> u16;
    /// MPS limits under the current FIFO bias
    fn mps_limits(&self) -> MpsLimits;

    // ---- Interrupt decode ----

    /// Classify and acknowledge the controller's pending interrupt
    fn decode_interrupt(&mut self) -> CoreInterrupt;
    /// Next channel with a pending interrupt, if any
    fn next_pending_channel(&mut self) -> Option<ChannelId>;
    /// Decode and acknowledge one channel's interrupt
    fn channel_decode_interrupt(&mut self, channel: ChannelId) -> ChannelEvent;
    /// Error cause after a [`ChannelEvent::Error`]
    fn channel_error(&self, channel: ChannelId) -> ChannelError;
    /// Descriptor index at which the channel stopped
    fn channel_stop_index(&self, channel: ChannelId) -> usize;

    // ---- Channels ----

    /// Claim a free hardware channel
    fn channel_alloc(&mut self) -> Option<ChannelId>;
    /// Release a claimed channel; it must be halted and inactive
    fn channel_free(&mut self, channel: ChannelId);
    /// Program endpoint characteristics into the channel registers
    fn channel_set_endpoint(&mut self, channel: ChannelId, ep: &EndpointCharacteristics);
    /// Start executing `list` on the channel beginning at `start_index`
    fn channel_activate(&mut self, channel: ChannelId, list: &[Self::Desc], start_index: usize);
    /// Request a halt of an active channel
    ///
    /// Returns `true` if the channel was already inactive (no
    /// [`ChannelEvent::HaltAcknowledged`] will follow), `false` if the halt
    /// was requested and the acknowledgment will arrive by interrupt.
    fn channel_request_halt(&mut self, channel: ChannelId) -> bool;
    /// Record an inactive channel as halted without touching the bus
    fn channel_mark_halted(&mut self, channel: ChannelId);
    /// Override the channel's transfer direction (control stages only)
    fn channel_set_direction(&mut self, channel: ChannelId, direction: Direction);
    /// Override the channel's next data toggle PID (control stages only)
    fn channel_set_pid(&mut self, channel: ChannelId, pid: DataPid);

    // ---- Transfer descriptors ----

    /// Encode one descriptor: transfer `len` bytes at `data` with `flags`
    ///
    /// `data` is `None` for zero length packets and null descriptors.
    fn desc_fill(&mut self, desc: &mut Self::Desc, data: Option<NonNull<u8>>, len: usize, flags: DescFlags);
    /// Reset a descriptor to its inactive state
    fn desc_clear(&mut self, desc: &mut Self::Desc);
    /// Decode a completed descriptor's remaining length and status
    fn desc_parse(&self, desc: &Self::Desc) -> DescResult;

    // ---- Cache/DMA synchronization ----
    //
    // No-ops by default for targets whose DMA is cache-coherent.

    /// Make the frame list visible to the controller
    fn sync_frame_list(&mut self, _frame_list: &FrameList) {}
    /// Synchronize a descriptor list across the cache/DMA boundary
    fn sync_desc_list(&mut self, _list: &[Self::Desc], _direction: SyncDirection) {}
    /// Synchronize an URB data buffer across the cache/DMA boundary
    fn sync_data_buffer(&mut self, _data: NonNull<u8>, _len: usize, _direction: SyncDirection) {}
}
