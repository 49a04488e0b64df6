//! Double-buffered transfer scheduling: descriptor lists, ring slots and
//! the per-type fill/parse routines
//!
//! Each pipe owns a ring of [`NUM_BUFFERS`] slots. A slot is filled with
//! one URB's descriptor list, executed on the pipe's channel, and parsed
//! after completion. Slot lifecycle is tracked purely by the ring's three
//! counters and three wrapping indices; the invariant
//! `to_fill + to_execute + to_parse == NUM_BUFFERS` holds after every ring
//! operation and is checked by the ring itself.

use crate::hal::{DescFlags, DescStatus, HostHal, FRAME_LIST_LEN};
use crate::pipe::PipeEvent;
use crate::transfer::{Direction, SetupPacket, TransferStatus, Urb, UrbFlags, SETUP_PACKET_SIZE};

/// Ring depth per pipe (double buffering)
pub(crate) const NUM_BUFFERS: usize = 2;

/// Descriptor list length for control pipes: one descriptor per stage
pub(crate) const XFER_LIST_LEN_CTRL: usize = 3;
/// Descriptor list length for bulk pipes: transfer plus optional ZLP
pub(crate) const XFER_LIST_LEN_BULK: usize = 2;
/// Descriptor list length for periodic pipes; same as the frame list so
/// one descriptor maps to one schedule slot
pub(crate) const XFER_LIST_LEN_PERIODIC: usize = FRAME_LIST_LEN;

/// Control transfer stage, doubling as the stage's descriptor index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlStage {
    Setup,
    Data,
    Status,
}

impl ControlStage {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Setup => 0,
            Self::Data => 1,
            Self::Status => 2,
        }
    }
}

/// Per-type metadata recorded when a slot is filled, consumed at execute
/// and parse time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FillMeta {
    /// Slot is empty
    None,
    Control {
        /// Data stage direction is IN
        data_stage_in: bool,
        /// The transfer has no data stage
        data_stage_skip: bool,
        /// Stage currently executing (or about to)
        stage: ControlStage,
    },
    Bulk {
        /// A trailing zero length packet descriptor was added
        zero_len_packet: bool,
    },
    Interrupt {
        /// Data descriptors filled, excluding any ZLP
        num_descs: usize,
        zero_len_packet: bool,
    },
    Isoc {
        /// Schedule slots spanned: packets × interval
        num_slots: usize,
        /// Slot spacing between consecutive packets
        interval: usize,
        /// First descriptor index of this buffer
        start_index: usize,
        /// First descriptor index for the buffer that follows
        next_start_index: usize,
    },
}

/// Completion details recorded by `commit_done`, consumed by parse
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferStatus {
    /// Buffer finished because of a halt request, not the bus
    pub was_canceled: bool,
    /// Descriptor index at which the channel stopped
    pub stop_index: usize,
    /// Pipe event that retired the buffer (`None` for halt/flush)
    pub pipe_event: PipeEvent,
}

impl Default for BufferStatus {
    fn default() -> Self {
        Self {
            was_canceled: false,
            stop_index: 0,
            pipe_event: PipeEvent::None,
        }
    }
}

/// One ring slot: an URB bound to its hardware descriptor list
pub(crate) struct BufferSlot<D> {
    pub descs: [D; XFER_LIST_LEN_PERIODIC],
    pub urb: Option<Urb>,
    pub fill: FillMeta,
    pub status: BufferStatus,
}

impl<D: Copy + Default> BufferSlot<D> {
    fn new() -> Self {
        Self {
            descs: [D::default(); XFER_LIST_LEN_PERIODIC],
            urb: None,
            fill: FillMeta::None,
            status: BufferStatus::default(),
        }
    }
}

/// Index into the ring that can only move forward, wrapping at
/// [`NUM_BUFFERS`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WrapIndex(u8);

impl WrapIndex {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn advance(&mut self) {
        self.0 = (self.0 + 1) % NUM_BUFFERS as u8;
    }

    /// Index one position behind this one
    pub(crate) fn previous(self) -> usize {
        (self.index() + NUM_BUFFERS - 1) % NUM_BUFFERS
    }
}

/// The per-pipe buffer ring
///
/// `wr` names the next slot to fill, `rd` the slot in flight (or next to
/// execute), `fr` the next slot to parse. Indices advance on fill and
/// parse respectively; the counters classify every slot as exactly one of
/// fillable, executable or parsable.
pub(crate) struct BufferRing<D> {
    slots: [BufferSlot<D>; NUM_BUFFERS],
    wr: WrapIndex,
    rd: WrapIndex,
    fr: WrapIndex,
    to_fill: u8,
    to_exec: u8,
    to_parse: u8,
    executing: bool,
}

impl<D: Copy + Default> BufferRing<D> {
    pub(crate) fn new() -> Self {
        Self {
            slots: [BufferSlot::new(), BufferSlot::new()],
            wr: WrapIndex::default(),
            rd: WrapIndex::default(),
            fr: WrapIndex::default(),
            to_fill: NUM_BUFFERS as u8,
            to_exec: 0,
            to_parse: 0,
            executing: false,
        }
    }

    fn check_accounting(&self) {
        debug_assert_eq!(
            self.to_fill + self.to_exec + self.to_parse,
            NUM_BUFFERS as u8,
            "buffer ring accounting broken"
        );
    }

    pub(crate) fn has_fillable(&self) -> bool {
        self.to_fill > 0
    }

    pub(crate) fn num_to_exec(&self) -> u8 {
        self.to_exec
    }

    pub(crate) fn num_to_parse(&self) -> u8 {
        self.to_parse
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.executing
    }

    /// Slot selected for the next fill
    pub(crate) fn fill_slot_mut(&mut self) -> &mut BufferSlot<D> {
        debug_assert!(self.to_fill > 0);
        &mut self.slots[self.wr.index()]
    }

    /// Slot filled immediately before the current fill slot (isochronous
    /// start-index chaining)
    pub(crate) fn previously_filled_slot(&self) -> &BufferSlot<D> {
        &self.slots[self.wr.previous()]
    }

    /// Reclassify the current fill slot as awaiting execution
    pub(crate) fn commit_fill(&mut self) {
        debug_assert!(self.to_fill > 0);
        self.wr.advance();
        self.to_fill -= 1;
        self.to_exec += 1;
        self.check_accounting();
    }

    /// Slot in flight (or next in line to execute)
    pub(crate) fn exec_slot_mut(&mut self) -> &mut BufferSlot<D> {
        debug_assert!(self.to_exec > 0);
        &mut self.slots[self.rd.index()]
    }

    pub(crate) fn exec_slot(&self) -> &BufferSlot<D> {
        debug_assert!(self.to_exec > 0);
        &self.slots[self.rd.index()]
    }

    /// Mark the in-flight slot as started
    pub(crate) fn begin_exec(&mut self) {
        debug_assert!(!self.executing && self.to_exec > 0);
        self.executing = true;
    }

    /// Retire the in-flight slot, recording how it stopped
    pub(crate) fn commit_done(&mut self, stop_index: usize, pipe_event: PipeEvent, canceled: bool) {
        debug_assert!(self.to_exec > 0);
        let slot = &mut self.slots[self.rd.index()];
        slot.status = BufferStatus {
            was_canceled: canceled,
            stop_index,
            pipe_event,
        };
        self.rd.advance();
        self.to_exec -= 1;
        self.to_parse += 1;
        self.executing = false;
        self.check_accounting();
    }

    /// Slot awaiting parse
    pub(crate) fn parse_slot_mut(&mut self) -> &mut BufferSlot<D> {
        debug_assert!(self.to_parse > 0);
        &mut self.slots[self.fr.index()]
    }

    /// Whether any slot currently holds the URB with this token
    pub(crate) fn contains_urb(&self, token: crate::transfer::UrbToken) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.urb.as_ref().is_some_and(|urb| urb.token == token))
    }

    /// Reclassify the parsed slot as fillable again
    pub(crate) fn commit_parse(&mut self) {
        debug_assert!(self.to_parse > 0);
        let slot = &mut self.slots[self.fr.index()];
        debug_assert!(slot.urb.is_none(), "parsed slot still owns an URB");
        slot.fill = FillMeta::None;
        slot.status = BufferStatus::default();
        self.fr.advance();
        self.to_parse -= 1;
        self.to_fill += 1;
        self.check_accounting();
    }
}

// ---------------------------------------------------------------- fill --

/// Build the three control stage descriptors from the URB's setup packet
pub(crate) fn fill_control<H: HostHal>(hal: &mut H, slot: &mut BufferSlot<H::Desc>, urb: &mut Urb) {
    let setup = SetupPacket::parse(&urb.data()[..SETUP_PACKET_SIZE]);
    let data_stage_in = setup.is_in();
    let data_stage_skip = setup.length == 0;
    let num_bytes = urb.num_bytes();

    // Setup stage: always OUT, always the 8 setup bytes
    let setup_ptr = Some(urb.data_ptr(0));
    let [d0, d1, d2, ..] = &mut slot.descs;
    hal.desc_fill(
        d0,
        setup_ptr,
        SETUP_PACKET_SIZE,
        DescFlags::SETUP | DescFlags::HALT_ON_COMPLETE,
    );
    if data_stage_skip {
        // No data stage; keep a null descriptor in its position
        hal.desc_clear(d1);
    } else {
        // The data stage may request more bytes than wLength
        let data_ptr = Some(urb.data_ptr(SETUP_PACKET_SIZE));
        let dir_flag = if data_stage_in { DescFlags::IN } else { DescFlags::empty() };
        hal.desc_fill(
            d1,
            data_ptr,
            num_bytes - SETUP_PACKET_SIZE,
            dir_flag | DescFlags::HALT_ON_COMPLETE,
        );
    }
    // Status stage is a ZLP opposite the data stage; IN when there is no
    // data stage
    let status_dir = if data_stage_in && !data_stage_skip {
        DescFlags::empty()
    } else {
        DescFlags::IN
    };
    hal.desc_fill(d2, None, 0, status_dir | DescFlags::HALT_ON_COMPLETE);

    slot.fill = FillMeta::Control {
        data_stage_in,
        data_stage_skip,
        stage: ControlStage::Setup,
    };
}

/// Build one bulk descriptor, plus a ZLP descriptor when requested
pub(crate) fn fill_bulk<H: HostHal>(
    hal: &mut H,
    slot: &mut BufferSlot<H::Desc>,
    urb: &mut Urb,
    direction: Direction,
    mps: usize,
) {
    let num_bytes = urb.num_bytes();
    // ZLP only for OUT, when requested, and only when the length divides
    // evenly into packets
    let zero_len_packet = direction == Direction::Out
        && urb.flags.contains(UrbFlags::ZERO_PACKET)
        && num_bytes % mps == 0;
    let data_ptr = Some(urb.data_ptr(0));
    let [d0, d1, ..] = &mut slot.descs;
    match direction {
        Direction::In => {
            hal.desc_fill(d0, data_ptr, num_bytes, DescFlags::IN | DescFlags::HALT_ON_COMPLETE);
        }
        Direction::Out if zero_len_packet => {
            hal.desc_fill(d0, data_ptr, num_bytes, DescFlags::empty());
            hal.desc_fill(d1, None, 0, DescFlags::HALT_ON_COMPLETE);
        }
        Direction::Out => {
            hal.desc_fill(d0, data_ptr, num_bytes, DescFlags::HALT_ON_COMPLETE);
        }
    }
    slot.fill = FillMeta::Bulk { zero_len_packet };
}

/// Split an interrupt transfer into MPS-sized descriptors
pub(crate) fn fill_interrupt<H: HostHal>(
    hal: &mut H,
    slot: &mut BufferSlot<H::Desc>,
    urb: &mut Urb,
    direction: Direction,
    mps: usize,
) {
    let num_bytes = urb.num_bytes();
    let mod_mps = num_bytes % mps;
    let zero_len_packet =
        direction == Direction::Out && urb.flags.contains(UrbFlags::ZERO_PACKET) && mod_mps == 0;
    let num_descs = if mod_mps == 0 {
        // IN transfers are validated to divide evenly at enqueue
        num_bytes / mps
    } else {
        num_bytes / mps + 1
    };
    debug_assert!(num_descs + usize::from(zero_len_packet) <= XFER_LIST_LEN_PERIODIC);

    let dir_flag = if direction == Direction::In { DescFlags::IN } else { DescFlags::empty() };
    let mut filled = 0;
    for i in 0..num_descs - 1 {
        let ptr = Some(urb.data_ptr(filled));
        hal.desc_fill(&mut slot.descs[i], ptr, mps, dir_flag);
        filled += mps;
    }
    let last_ptr = Some(urb.data_ptr(filled));
    let last_len = num_bytes - filled;
    if zero_len_packet {
        // The channel halts on the ZLP instead of the final data packet
        hal.desc_fill(&mut slot.descs[num_descs - 1], last_ptr, last_len, dir_flag);
        hal.desc_fill(&mut slot.descs[num_descs], None, 0, DescFlags::HALT_ON_COMPLETE);
    } else {
        hal.desc_fill(
            &mut slot.descs[num_descs - 1],
            last_ptr,
            last_len,
            dir_flag | DescFlags::HALT_ON_COMPLETE,
        );
    }

    slot.fill = FillMeta::Interrupt {
        num_descs,
        zero_len_packet,
    };
}

/// Place one descriptor per isochronous packet, spaced by the endpoint's
/// interval starting at `start_index`
pub(crate) fn fill_isoc<H: HostHal>(
    hal: &mut H,
    slot: &mut BufferSlot<H::Desc>,
    urb: &mut Urb,
    direction: Direction,
    interval: usize,
    start_index: usize,
) {
    debug_assert!(interval > 0 && interval.is_power_of_two());
    let num_packets = urb.isoc_packets.len();
    let num_slots = num_packets * interval;
    debug_assert!(num_slots <= XFER_LIST_LEN_PERIODIC);

    // Start from a clean list; only the scheduled slots become active
    for desc in slot.descs.iter_mut() {
        hal.desc_clear(desc);
    }
    let mut desc_index = start_index;
    let mut filled = 0;
    for packet in 0..num_packets {
        let len = urb.isoc_packets[packet].num_bytes;
        let mut flags = if direction == Direction::In { DescFlags::IN } else { DescFlags::empty() };
        if packet == num_packets - 1 {
            flags |= DescFlags::HALT_ON_COMPLETE;
        }
        let ptr = Some(urb.data_ptr(filled));
        hal.desc_fill(&mut slot.descs[desc_index], ptr, len, flags);
        filled += len;
        desc_index = (desc_index + interval) % XFER_LIST_LEN_PERIODIC;
    }

    slot.fill = FillMeta::Isoc {
        num_slots,
        interval,
        start_index,
        next_start_index: desc_index,
    };
}

// --------------------------------------------------------------- parse --

/// Recover the control transfer result from the data stage descriptor
pub(crate) fn parse_control<H: HostHal>(hal: &H, slot: &mut BufferSlot<H::Desc>) {
    let FillMeta::Control { data_stage_skip, .. } = slot.fill else {
        debug_assert!(false, "parse_control on a non-control slot");
        return;
    };
    let Some(urb) = slot.urb.as_mut() else { return };
    if data_stage_skip {
        // No data stage; only the setup bytes moved
        urb.actual_num_bytes = SETUP_PACKET_SIZE;
    } else {
        let result = hal.desc_parse(&slot.descs[ControlStage::Data.index()]);
        debug_assert_eq!(result.status, DescStatus::Success);
        debug_assert!(result.remaining <= urb.num_bytes() - SETUP_PACKET_SIZE);
        urb.actual_num_bytes = urb.num_bytes() - result.remaining;
    }
    urb.status = Some(TransferStatus::Completed);
}

/// Recover the bulk transfer result from its single data descriptor
pub(crate) fn parse_bulk<H: HostHal>(hal: &H, slot: &mut BufferSlot<H::Desc>) {
    let Some(urb) = slot.urb.as_mut() else { return };
    let result = hal.desc_parse(&slot.descs[0]);
    debug_assert_eq!(result.status, DescStatus::Success);
    debug_assert!(result.remaining <= urb.num_bytes());
    urb.actual_num_bytes = urb.num_bytes() - result.remaining;
    urb.status = Some(TransferStatus::Completed);
}

/// Recover an interrupt transfer result, detecting and sizing a short
/// packet on IN endpoints
pub(crate) fn parse_interrupt<H: HostHal>(
    hal: &H,
    slot: &mut BufferSlot<H::Desc>,
    direction: Direction,
    mps: usize,
) {
    let FillMeta::Interrupt { num_descs, .. } = slot.fill else {
        debug_assert!(false, "parse_interrupt on a non-interrupt slot");
        return;
    };
    let stop_index = slot.status.stop_index;
    let Some(urb) = slot.urb.as_mut() else { return };
    match direction {
        Direction::In => {
            if stop_index > 0 {
                // Early stop: the packet at stop_index - 1 came up short.
                // Every earlier packet must have filled completely.
                debug_assert!(stop_index <= num_descs);
                #[cfg(debug_assertions)]
                for i in 0..stop_index - 1 {
                    let full = hal.desc_parse(&slot.descs[i]);
                    debug_assert!(
                        full.remaining == 0 && full.status == DescStatus::Success,
                        "short packet before the stop index"
                    );
                }
                let short = hal.desc_parse(&slot.descs[stop_index - 1]);
                debug_assert!(short.remaining > 0 && short.status == DescStatus::Success);
                urb.actual_num_bytes = mps * (stop_index - 1) + (mps - short.remaining);
            } else {
                // Full completion; only the final packet may be short
                #[cfg(debug_assertions)]
                for i in 0..num_descs - 1 {
                    let full = hal.desc_parse(&slot.descs[i]);
                    debug_assert!(
                        full.remaining == 0 && full.status == DescStatus::Success,
                        "short packet before the final descriptor"
                    );
                }
                let last = hal.desc_parse(&slot.descs[num_descs - 1]);
                debug_assert_eq!(last.status, DescStatus::Success);
                urb.actual_num_bytes = urb.num_bytes() - last.remaining;
            }
        }
        Direction::Out => {
            // OUT interrupt transfers complete only when every packet went out
            #[cfg(debug_assertions)]
            for i in 0..num_descs {
                let full = hal.desc_parse(&slot.descs[i]);
                debug_assert!(full.remaining == 0 && full.status == DescStatus::Success);
            }
            urb.actual_num_bytes = urb.num_bytes();
        }
    }
    urb.status = Some(TransferStatus::Completed);
}

/// Walk each isochronous packet's descriptor, recording per-packet results
/// independently
pub(crate) fn parse_isoc<H: HostHal>(hal: &mut H, slot: &mut BufferSlot<H::Desc>, direction: Direction) {
    let FillMeta::Isoc { interval, start_index, .. } = slot.fill else {
        debug_assert!(false, "parse_isoc on a non-isochronous slot");
        return;
    };
    let Some(urb) = slot.urb.as_mut() else { return };
    let mut desc_index = start_index;
    let mut total = 0;
    for packet in urb.isoc_packets.iter_mut() {
        let result = hal.desc_parse(&slot.descs[desc_index]);
        hal.desc_clear(&mut slot.descs[desc_index]);
        debug_assert!(result.remaining == 0 || direction == Direction::In);
        debug_assert!(result.status == DescStatus::Success || result.status == DescStatus::NotExecuted);
        debug_assert!(result.remaining <= packet.num_bytes);
        packet.actual_num_bytes = packet.num_bytes - result.remaining;
        packet.status = Some(if result.status == DescStatus::NotExecuted {
            TransferStatus::Skipped
        } else {
            TransferStatus::Completed
        });
        total += packet.actual_num_bytes;
        desc_index = (desc_index + interval) % XFER_LIST_LEN_PERIODIC;
    }
    debug_assert!(total <= urb.num_bytes());
    urb.actual_num_bytes = total;
    urb.status = Some(TransferStatus::Completed);
}

/// Resolve a failed or canceled buffer into a per-URB status
pub(crate) fn parse_failed(slot: &mut BufferSlot<impl Copy>) {
    let pipe_event = slot.status.pipe_event;
    let canceled = slot.status.was_canceled;
    let Some(urb) = slot.urb.as_mut() else { return };
    urb.actual_num_bytes = 0;
    urb.status = Some(match pipe_event {
        PipeEvent::None => {
            if canceled {
                TransferStatus::Canceled
            } else {
                TransferStatus::NoDevice
            }
        }
        PipeEvent::ErrorTransfer => TransferStatus::Error,
        PipeEvent::ErrorOverflow => TransferStatus::Overflow,
        PipeEvent::ErrorStall => TransferStatus::Stall,
        // UrbDone and ErrorUrbNotAvailable never reach the failure path
        PipeEvent::UrbDone | PipeEvent::ErrorUrbNotAvailable => {
            debug_assert!(false, "unexpected pipe event in failed parse");
            TransferStatus::Error
        }
    });
}
