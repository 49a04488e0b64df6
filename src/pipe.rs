//! Pipe object, state machine and the buffer pipeline
//!
//! A pipe binds one device endpoint to one hardware channel. URBs enqueued
//! on the pipe flow through the double-buffer ring: fill (descriptor list
//! built from the head pending URB), execute (handed to the channel),
//! parse (results extracted, URB moved to the done queue). Control
//! transfers additionally re-execute the same buffer per stage instead of
//! consuming a new URB.

use crate::buffer::{
    fill_bulk, fill_control, fill_interrupt, fill_isoc, parse_bulk, parse_control, parse_failed,
    parse_interrupt, parse_isoc, BufferRing, ControlStage, FillMeta, NUM_BUFFERS, XFER_LIST_LEN_BULK,
    XFER_LIST_LEN_CTRL, XFER_LIST_LEN_PERIODIC,
};
use crate::hal::{
    ChannelId, DataPid, EndpointCharacteristics, HostHal, MpsLimits, PeriodicCharacteristics, Speed,
    SyncDirection,
};
use crate::os::HostOs;
use crate::transfer::{Direction, EndpointAddress, TransferType, Urb, UrbState};
use heapless::Deque;

/// Pending URBs a pipe can hold
pub const URB_QUEUE_DEPTH: usize = 8;
/// Done queue must absorb every pending URB plus both ring buffers
pub(crate) const DONE_QUEUE_DEPTH: usize = URB_QUEUE_DEPTH + NUM_BUFFERS;

/// Largest default-pipe MPS for a low speed device
const CTRL_EP_MAX_MPS_LS: u16 = 8;
/// Largest default-pipe MPS for full and high speed devices
const CTRL_EP_MAX_MPS_HSFS: u16 = 64;

// Isochronous scheduling thresholds, in PHY clocks: the fill-to-activate
// latency is roughly BASE + PER_PACKET per packet. Calibration values for
// the DWC OTG PHY; retune for other controllers.
const ISOC_SCHED_PHY_CLKS_BASE: u16 = 180;
const ISOC_SCHED_PHY_CLKS_MARGIN: u16 = 15;
const ISOC_SCHED_PHY_CLKS_PER_PACKET: u16 = 5;
/// Busy-wait to step past an uncertain frame boundary
const ISOC_SCHED_SETTLE_US: u32 = 10;

/// Pipe states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeState {
    /// Buffers may be filled and executed
    Active,
    /// No new execution; cleared with [`PipeCommand::Clear`]
    Halted,
}

/// Pipe events, delivered via callback and latched for
/// [`UsbHost::pipe_event`]
///
/// Error events force the pipe to `Halted` as a side effect.
///
/// [`UsbHost::pipe_event`]: crate::host::UsbHost::pipe_event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeEvent {
    /// No event
    None,
    /// One or more URBs can be dequeued
    UrbDone,
    /// Excessive transaction errors on the endpoint
    ErrorTransfer,
    /// The channel ran out of descriptors
    ErrorUrbNotAvailable,
    /// Packet babble from the device
    ErrorOverflow,
    /// The endpoint returned STALL
    ErrorStall,
}

/// Pipe commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeCommand {
    /// Active → Halted; blocks until any in-flight buffer is retired
    Halt,
    /// Retire every filled buffer and pending URB as canceled; pipe must
    /// already be halted
    Flush,
    /// Halted → Active; resumes the pipeline for remaining pending URBs
    Clear,
}

/// Pipe callback, invoked by the interrupt dispatcher (or synchronously by
/// [`PipeCommand::Flush`])
///
/// The `bool` argument is `true` when called from interrupt context.
pub type PipeCallback = fn(PipeHandle, PipeEvent, bool);

/// Opaque pipe handle: an arena index plus a generation stamp so stale
/// handles are rejected after the slot is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle {
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

/// Parsed endpoint descriptor fields needed to schedule the endpoint
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// Endpoint address (number + direction)
    pub address: EndpointAddress,
    /// Transfer type from the attributes field
    pub transfer_type: TransferType,
    /// Maximum packet size
    pub max_packet_size: u16,
    /// Raw `bInterval` value
    pub interval: u8,
}

/// Configuration for [`UsbHost::pipe_alloc`]
///
/// [`UsbHost::pipe_alloc`]: crate::host::UsbHost::pipe_alloc
#[derive(Debug, Clone, Copy)]
pub struct PipeConfig {
    /// Target endpoint, or `None` for the device's default control pipe
    pub endpoint: Option<EndpointDescriptor>,
    /// Device address the pipe targets
    pub device_address: u8,
    /// Speed of the device
    pub device_speed: Speed,
    /// Event callback, run by the interrupt dispatcher
    pub callback: Option<PipeCallback>,
}

/// Driver-side pipe object
pub(crate) struct Pipe<H: HostHal> {
    pub channel: ChannelId,
    pub ep: EndpointCharacteristics,
    pub state: PipeState,
    pub last_event: PipeEvent,
    pub ring: BufferRing<H::Desc>,
    pub pending: Deque<Urb, URB_QUEUE_DEPTH>,
    pub done: Deque<Urb, DONE_QUEUE_DEPTH>,
    /// A halt command is blocked waiting for the channel's acknowledgment
    pub waiting_halt: bool,
    /// A pipe command is executing
    pub cmd_processing: bool,
    /// At least one URB is pending, in flight or done
    pub has_urb: bool,
    pub callback: Option<PipeCallback>,
}

impl<H: HostHal> Pipe<H> {
    pub(crate) fn new(
        channel: ChannelId,
        ep: EndpointCharacteristics,
        callback: Option<PipeCallback>,
    ) -> Self {
        Self {
            channel,
            ep,
            state: PipeState::Active,
            last_event: PipeEvent::None,
            ring: BufferRing::new(),
            pending: Deque::new(),
            done: Deque::new(),
            waiting_halt: false,
            cmd_processing: false,
            has_urb: false,
            callback,
        }
    }

    /// A pending URB exists and a ring slot is free to take it
    pub(crate) fn can_fill(&self) -> bool {
        !self.pending.is_empty() && self.ring.has_fillable()
    }

    /// A filled buffer exists and nothing is currently executing
    pub(crate) fn can_exec(&self) -> bool {
        !self.ring.is_executing() && self.ring.num_to_exec() > 0
    }

    /// A completed buffer is waiting to be parsed
    pub(crate) fn can_parse(&self) -> bool {
        self.ring.num_to_parse() > 0
    }

    /// Pop the head pending URB and build its descriptor list into the
    /// next free ring slot
    ///
    /// Callers must check [`Pipe::can_fill`] first.
    pub(crate) fn buffer_fill<O: HostOs>(&mut self, hal: &mut H) {
        let Some(mut urb) = self.pending.pop_front() else {
            debug_assert!(false, "buffer_fill without a pending URB");
            return;
        };
        let direction = self.ep.address.direction();
        let mps = self.ep.mps as usize;
        match self.ep.transfer_type {
            TransferType::Control => {
                fill_control(hal, self.ring.fill_slot_mut(), &mut urb);
            }
            TransferType::Bulk => {
                fill_bulk(hal, self.ring.fill_slot_mut(), &mut urb, direction, mps);
            }
            TransferType::Interrupt => {
                fill_interrupt(hal, self.ring.fill_slot_mut(), &mut urb, direction, mps);
            }
            TransferType::Isochronous => {
                // One descriptor per (micro)frame slot; an interval longer
                // than the list collapses to the list length
                let interval =
                    (self.ep.periodic.interval as usize).clamp(1, XFER_LIST_LEN_PERIODIC);
                let start_index = if self.ring.num_to_exec() == 0 {
                    self.fresh_isoc_start_index::<O>(hal, interval, urb.isoc_packets.len())
                } else {
                    // Chain onto the previous buffer so back-to-back
                    // buffers tile the schedule without gaps or overlaps
                    match self.ring.previously_filled_slot().fill {
                        FillMeta::Isoc { next_start_index, .. } => next_start_index,
                        _ => {
                            debug_assert!(false, "isochronous chaining without a prior buffer");
                            0
                        }
                    }
                };
                fill_isoc(
                    hal,
                    self.ring.fill_slot_mut(),
                    &mut urb,
                    direction,
                    interval,
                    start_index,
                );
            }
        }
        let slot = self.ring.fill_slot_mut();
        hal.sync_desc_list(&slot.descs, SyncDirection::ToDevice);
        urb.state = UrbState::InFlight;
        slot.urb = Some(urb);
        self.ring.commit_fill();
    }

    /// Choose a start index from the hardware frame counter for an
    /// isochronous buffer with no predecessor in flight
    fn fresh_isoc_start_index<O: HostOs>(
        &self,
        hal: &mut H,
        interval: usize,
        num_packets: usize,
    ) -> usize {
        // The next frame the periodic scheduler will fetch
        let mut start = hal.frame_number() as usize + 1;
        let remaining = hal.frame_time_remaining();
        let threshold =
            ISOC_SCHED_PHY_CLKS_BASE + ISOC_SCHED_PHY_CLKS_PER_PACKET * num_packets as u16;
        if remaining < threshold + ISOC_SCHED_PHY_CLKS_MARGIN {
            if remaining > threshold.saturating_sub(ISOC_SCHED_PHY_CLKS_MARGIN) {
                // Within the uncertainty window around the threshold; wait
                // out the frame boundary so the choice is deterministic
                O::delay_us(ISOC_SCHED_SETTLE_US);
            }
            start += 1;
        }
        // Round up to this endpoint's phase offset within its interval.
        // Wrapping arithmetic is exact because the interval is a power of
        // two.
        if interval > 1 {
            let misalign =
                (start as u32).wrapping_sub(self.ep.periodic.offset as u32) % interval as u32;
            if misalign > 0 {
                start += interval - misalign as usize;
            }
        }
        start % XFER_LIST_LEN_PERIODIC
    }

    /// Hand the next filled buffer to the channel
    ///
    /// Callers must check [`Pipe::can_exec`] first.
    pub(crate) fn buffer_exec(&mut self, hal: &mut H) {
        debug_assert!(self.can_exec());
        let channel = self.channel;
        let (start, len) = match self.ring.exec_slot().fill {
            FillMeta::Control { .. } => {
                // Setup stage: direction OUT, PID DATA0
                hal.channel_set_direction(channel, Direction::Out);
                hal.channel_set_pid(channel, DataPid::Data0);
                (0, XFER_LIST_LEN_CTRL)
            }
            FillMeta::Isoc { start_index, .. } => (start_index, XFER_LIST_LEN_PERIODIC),
            FillMeta::Bulk { zero_len_packet } => {
                (0, if zero_len_packet { XFER_LIST_LEN_BULK } else { 1 })
            }
            FillMeta::Interrupt { num_descs, zero_len_packet } => {
                (0, num_descs + usize::from(zero_len_packet))
            }
            FillMeta::None => {
                debug_assert!(false, "executing an unfilled buffer");
                return;
            }
        };
        self.ring.begin_exec();
        hal.channel_activate(channel, &self.ring.exec_slot().descs[..len], start);
    }

    /// Whether the in-flight buffer is finished, or needs a control stage
    /// continuation
    pub(crate) fn buffer_check_done(&self) -> bool {
        match self.ring.exec_slot().fill {
            FillMeta::Control { stage, .. } => stage == ControlStage::Status,
            _ => true,
        }
    }

    /// Advance the in-flight control buffer to its next stage and
    /// re-execute it without consuming a new URB
    pub(crate) fn buffer_exec_cont(&mut self, hal: &mut H) {
        let channel = self.channel;
        let slot = self.ring.exec_slot_mut();
        let FillMeta::Control { data_stage_in, data_stage_skip, ref mut stage } = slot.fill else {
            debug_assert!(false, "stage continuation on a non-control buffer");
            return;
        };
        debug_assert!(*stage != ControlStage::Status);
        let next_dir = match *stage {
            ControlStage::Setup if data_stage_skip => {
                // No data stage: jump over the null descriptor; the status
                // stage of a no-data transfer is always IN
                *stage = ControlStage::Status;
                Direction::In
            }
            ControlStage::Setup => {
                *stage = ControlStage::Data;
                if data_stage_in { Direction::In } else { Direction::Out }
            }
            ControlStage::Data | ControlStage::Status => {
                // Status stage runs opposite the data stage
                *stage = ControlStage::Status;
                if data_stage_in { Direction::Out } else { Direction::In }
            }
        };
        let start = stage.index();
        hal.channel_set_direction(channel, next_dir);
        // Data and status stages both start on DATA1
        hal.channel_set_pid(channel, DataPid::Data1);
        hal.channel_activate(channel, &self.ring.exec_slot().descs[..XFER_LIST_LEN_CTRL], start);
    }

    /// Retire the in-flight buffer
    pub(crate) fn buffer_done(&mut self, stop_index: usize, pipe_event: PipeEvent, canceled: bool) {
        self.ring.commit_done(stop_index, pipe_event, canceled);
    }

    /// Extract the next completed buffer's results into its URB and move
    /// the URB to the done queue
    ///
    /// Callers must check [`Pipe::can_parse`] first.
    pub(crate) fn buffer_parse(&mut self, hal: &mut H) {
        debug_assert!(self.can_parse());
        let direction = self.ep.address.direction();
        let mps = self.ep.mps as usize;
        let transfer_type = self.ep.transfer_type;
        let slot = self.ring.parse_slot_mut();
        debug_assert!(slot.urb.is_some());
        hal.sync_desc_list(&slot.descs, SyncDirection::FromDevice);

        if slot.status.pipe_event == PipeEvent::UrbDone {
            match transfer_type {
                TransferType::Control => parse_control(hal, slot),
                TransferType::Bulk => parse_bulk(hal, slot),
                TransferType::Interrupt => parse_interrupt(hal, slot, direction, mps),
                TransferType::Isochronous => parse_isoc(hal, slot, direction),
            }
        } else {
            parse_failed(slot);
        }
        // Leave no stale descriptors behind; isochronous parse already
        // cleared the slots it visited
        let used = match slot.fill {
            FillMeta::Control { .. } => XFER_LIST_LEN_CTRL,
            FillMeta::Bulk { .. } => XFER_LIST_LEN_BULK,
            FillMeta::Interrupt { num_descs, zero_len_packet } => {
                num_descs + usize::from(zero_len_packet)
            }
            FillMeta::Isoc { .. } | FillMeta::None => 0,
        };
        for desc in slot.descs[..used].iter_mut() {
            hal.desc_clear(desc);
        }

        if let Some(mut urb) = slot.urb.take() {
            urb.state = UrbState::Done;
            let pushed = self.done.push_back(urb);
            debug_assert!(pushed.is_ok(), "done queue sized below pending + ring capacity");
        }
        self.ring.commit_parse();
    }

    /// Retire every filled buffer as canceled/no-device and parse them
    /// all, without touching hardware
    ///
    /// Only legal when no buffer is executing. Returns whether any buffer
    /// was flushed.
    pub(crate) fn buffer_flush_all(&mut self, hal: &mut H, canceled: bool) -> bool {
        debug_assert!(!self.ring.is_executing());
        let num_to_mark_done = self.ring.num_to_exec();
        for _ in 0..num_to_mark_done {
            self.ring.commit_done(0, PipeEvent::None, canceled);
        }
        let num_to_parse = self.ring.num_to_parse();
        for _ in 0..num_to_parse {
            self.buffer_parse(hal);
        }
        num_to_parse > 0
    }
}

// ------------------------------------------------------ pipe admission --

/// Reject endpoint/port speed combinations USB 2.0 does not allow
pub(crate) fn verify_usb_compliance(
    device_speed: Speed,
    port_speed: Speed,
    transfer_type: TransferType,
) -> bool {
    if port_speed == Speed::Low && device_speed == Speed::Full {
        #[cfg(feature = "defmt")]
        defmt::error!("Low speed port does not support full speed pipe");
        return false;
    }
    if device_speed == Speed::Low
        && matches!(transfer_type, TransferType::Bulk | TransferType::Isochronous)
    {
        #[cfg(feature = "defmt")]
        defmt::error!("Low speed does not support bulk or isochronous pipes");
        return false;
    }
    true
}

/// Reject endpoints the controller cannot schedule (zero interval, MPS
/// above the FIFO-derived limits)
pub(crate) fn verify_controller_support(limits: &MpsLimits, ep: &EndpointDescriptor) -> bool {
    if matches!(ep.transfer_type, TransferType::Interrupt | TransferType::Isochronous)
        && ep.interval == 0
    {
        #[cfg(feature = "defmt")]
        defmt::error!("bInterval of 0 invalid for a periodic pipe");
        return false;
    }
    let limit = match ep.address.direction() {
        Direction::In => limits.in_mps,
        Direction::Out => match ep.transfer_type {
            TransferType::Control | TransferType::Bulk => limits.non_periodic_out_mps,
            TransferType::Interrupt | TransferType::Isochronous => limits.periodic_out_mps,
        },
    };
    if ep.max_packet_size > limit {
        #[cfg(feature = "defmt")]
        defmt::error!(
            "EP MPS ({}) exceeds supported limit ({})",
            ep.max_packet_size,
            limit
        );
        return false;
    }
    true
}

/// Derive the channel's endpoint characteristics from the pipe config
pub(crate) fn derive_endpoint_characteristics(
    config: &PipeConfig,
    transfer_type: TransferType,
    pipe_index: usize,
    port_speed: Speed,
) -> EndpointCharacteristics {
    let (address, mps) = match &config.endpoint {
        // Default pipe: EP0 with the worst case MPS for the device speed
        None => (
            EndpointAddress::control(),
            if config.device_speed == Speed::Low { CTRL_EP_MAX_MPS_LS } else { CTRL_EP_MAX_MPS_HSFS },
        ),
        Some(ep) => (ep.address, ep.max_packet_size),
    };
    let periodic = match &config.endpoint {
        Some(ep)
            if matches!(transfer_type, TransferType::Interrupt | TransferType::Isochronous) =>
        {
            // bInterval decoding per USB 2.0 table 9-13: FS/LS interrupt
            // endpoints give frames directly, everything else 2^(n-1)
            let interval =
                if transfer_type == TransferType::Interrupt && config.device_speed != Speed::High {
                    ep.interval as u16
                } else {
                    1u16 << (ep.interval - 1)
                };
            // The Nth allocated pipe takes phase N within its interval so
            // periodic pipes spread over the schedule
            let offset = ((pipe_index % XFER_LIST_LEN_PERIODIC) as u16) % interval;
            PeriodicCharacteristics {
                interval,
                offset,
                is_high_speed: config.device_speed == Speed::High,
            }
        }
        _ => PeriodicCharacteristics::none(),
    };
    EndpointCharacteristics {
        transfer_type,
        address,
        mps,
        device_address: config.device_address,
        ls_via_fs_hub: port_speed == Speed::Full && config.device_speed == Speed::Low,
        periodic,
    }
}
