//! Mock hardware and OS for driving the driver without a controller
//!
//! [`MockHal`] is a scriptable [`HostHal`]: tests inject port signals and
//! channel events, script per-descriptor results, and inspect snapshots of
//! every channel activation. [`MockOs`] pumps the interrupt dispatcher
//! from inside delays and yield points, which is what lets the blocking
//! commands (reset, resume, disable, halt) complete in a single thread.

#![allow(dead_code)]

use std::boxed::Box;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use usbh_hcd::hal::{
    ChannelError, ChannelEvent, ChannelId, CoreInterrupt, DataPid, DescFlags, DescResult,
    DescStatus, EndpointCharacteristics, FifoBias, FrameList, HostHal, MpsLimits, PortSignal,
    Speed,
};
use usbh_hcd::os::HostOs;
use usbh_hcd::transfer::Direction;

pub const MOCK_CHANNELS: usize = 8;

/// Mock in-memory transfer descriptor
///
/// `desc_fill` stamps the request into the descriptor and attaches the
/// next scripted result (default: fully transferred).
#[derive(Clone, Copy, Debug)]
pub struct MockDesc {
    pub active: bool,
    pub len: usize,
    pub flags: DescFlags,
    pub has_data: bool,
    pub remaining: usize,
    pub status: DescStatus,
}

impl Default for MockDesc {
    fn default() -> Self {
        Self {
            active: false,
            len: 0,
            flags: DescFlags::empty(),
            has_data: false,
            remaining: 0,
            status: DescStatus::Success,
        }
    }
}

/// Snapshot of one `channel_activate` call
#[derive(Clone, Debug)]
pub struct Activation {
    pub channel: u8,
    pub start_index: usize,
    pub descs: Vec<MockDesc>,
}

impl Activation {
    /// Indices of descriptors that were filled (active) in this activation
    pub fn active_indices(&self) -> Vec<usize> {
        self.descs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.active)
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Default)]
pub struct MockChannel {
    pub allocated: bool,
    pub active: bool,
    pub pending_event: Option<ChannelEvent>,
    pub stop_index: usize,
    pub error: Option<ChannelError>,
    pub endpoint: Option<EndpointCharacteristics>,
    pub directions: Vec<Direction>,
    pub pids: Vec<DataPid>,
    pub halted: bool,
}

/// Shared mock controller state; tests hold a handle alongside the driver
pub struct MockCore {
    pub connected: bool,
    pub speed: Speed,
    pub port_enabled: bool,
    pub pending_port: VecDeque<PortSignal>,
    pub channels: [MockChannel; MOCK_CHANNELS],
    pub frame_number: u16,
    pub frame_time_remaining: u16,
    /// Scripted `(remaining, status)` results, consumed in fill order
    pub fill_results: VecDeque<(usize, DescStatus)>,
    pub activations: Vec<Activation>,
    /// `channel_request_halt` immediately queues the acknowledgment
    pub auto_ack_halt: bool,
}

impl Default for MockCore {
    fn default() -> Self {
        Self {
            connected: false,
            speed: Speed::Full,
            port_enabled: false,
            pending_port: VecDeque::new(),
            channels: Default::default(),
            frame_number: 0,
            frame_time_remaining: 1000,
            fill_results: VecDeque::new(),
            activations: Vec::new(),
            auto_ack_halt: true,
        }
    }
}

/// Cloneable handle implementing [`HostHal`] over the shared state
#[derive(Clone)]
pub struct MockHal(pub Rc<RefCell<MockCore>>);

impl MockHal {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(MockCore::default())))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockCore) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    /// Attach a device and queue the connect interrupt
    pub fn attach_device(&self, speed: Speed) {
        self.with(|core| {
            core.connected = true;
            core.speed = speed;
            core.pending_port.push_back(PortSignal::Connect);
        });
    }

    /// Pull the device and queue the disconnect interrupt
    pub fn detach_device(&self) {
        self.with(|core| {
            core.connected = false;
            core.port_enabled = false;
            core.pending_port.push_back(PortSignal::Disconnect);
        });
    }

    /// Queue a completion interrupt for a channel
    pub fn complete_channel(&self, channel: u8) {
        self.with(|core| {
            let ch = &mut core.channels[channel as usize];
            ch.active = false;
            ch.pending_event = Some(ChannelEvent::Completed);
        });
    }

    /// Queue a completion interrupt that stopped early at `stop_index`
    pub fn complete_channel_short(&self, channel: u8, stop_index: usize) {
        self.with(|core| {
            let ch = &mut core.channels[channel as usize];
            ch.active = false;
            ch.stop_index = stop_index;
            ch.pending_event = Some(ChannelEvent::Completed);
        });
    }

    /// Queue an error interrupt for a channel
    pub fn fail_channel(&self, channel: u8, error: ChannelError) {
        self.with(|core| {
            let ch = &mut core.channels[channel as usize];
            ch.active = false;
            ch.error = Some(error);
            ch.pending_event = Some(ChannelEvent::Error);
        });
    }

    pub fn num_activations(&self) -> usize {
        self.with(|core| core.activations.len())
    }

    pub fn activation(&self, index: usize) -> Activation {
        self.with(|core| core.activations[index].clone())
    }

    pub fn last_activation(&self) -> Activation {
        self.with(|core| core.activations.last().expect("no activations recorded").clone())
    }
}

impl HostHal for MockHal {
    type Desc = MockDesc;

    fn core_init(&mut self) {}
    fn core_deinit(&mut self) {}
    fn core_soft_reset(&mut self) {
        self.with(|core| {
            core.port_enabled = false;
            core.pending_port.clear();
            for ch in core.channels.iter_mut() {
                *ch = MockChannel::default();
            }
        });
    }
    fn interrupt_enable(&mut self, _enabled: bool) {}

    fn port_init(&mut self) {}
    fn port_deinit(&mut self) {}
    fn port_set_power(&mut self, on: bool) {
        if !on {
            self.with(|core| core.port_enabled = false);
        }
    }
    fn port_assert_reset(&mut self, asserted: bool) {
        self.with(|core| {
            if asserted {
                // Resetting an enabled port disables it first
                if core.port_enabled {
                    core.port_enabled = false;
                    core.pending_port.push_back(PortSignal::Disabled);
                }
            } else if core.connected {
                core.pending_port.push_back(PortSignal::Enabled);
            }
        });
    }
    fn port_assert_resume(&mut self, _asserted: bool) {}
    fn port_suspend(&mut self) {}
    fn port_disable(&mut self) {
        self.with(|core| {
            core.port_enabled = false;
            core.pending_port.push_back(PortSignal::Disabled);
        });
    }
    fn port_enable(&mut self) {
        self.with(|core| core.port_enabled = true);
    }
    fn port_speed(&self) -> Speed {
        self.with(|core| core.speed)
    }
    fn port_connected(&self) -> bool {
        self.with(|core| core.connected)
    }
    fn port_clear_debounce_lock(&mut self) {}
    fn set_fifo_bias(&mut self, _bias: FifoBias) {}
    fn install_frame_list(&mut self, _frame_list: &FrameList) {}
    fn periodic_enable(&mut self) {}
    fn frame_number(&self) -> u16 {
        self.with(|core| core.frame_number)
    }
    fn frame_time_remaining(&self) -> u16 {
        self.with(|core| core.frame_time_remaining)
    }
    fn mps_limits(&self) -> MpsLimits {
        MpsLimits {
            in_mps: 512,
            non_periodic_out_mps: 512,
            periodic_out_mps: 512,
        }
    }

    fn decode_interrupt(&mut self) -> CoreInterrupt {
        self.with(|core| {
            if let Some(signal) = core.pending_port.pop_front() {
                CoreInterrupt::Port(signal)
            } else if core.channels.iter().any(|ch| ch.pending_event.is_some()) {
                CoreInterrupt::Channel
            } else {
                CoreInterrupt::None
            }
        })
    }
    fn next_pending_channel(&mut self) -> Option<ChannelId> {
        self.with(|core| {
            core.channels
                .iter()
                .position(|ch| ch.pending_event.is_some())
                .map(|i| ChannelId(i as u8))
        })
    }
    fn channel_decode_interrupt(&mut self, channel: ChannelId) -> ChannelEvent {
        self.with(|core| {
            core.channels[channel.0 as usize]
                .pending_event
                .take()
                .unwrap_or(ChannelEvent::None)
        })
    }
    fn channel_error(&self, channel: ChannelId) -> ChannelError {
        self.with(|core| {
            core.channels[channel.0 as usize]
                .error
                .unwrap_or(ChannelError::Transaction)
        })
    }
    fn channel_stop_index(&self, channel: ChannelId) -> usize {
        self.with(|core| core.channels[channel.0 as usize].stop_index)
    }

    fn channel_alloc(&mut self) -> Option<ChannelId> {
        self.with(|core| {
            let index = core.channels.iter().position(|ch| !ch.allocated)?;
            core.channels[index].allocated = true;
            Some(ChannelId(index as u8))
        })
    }
    fn channel_free(&mut self, channel: ChannelId) {
        self.with(|core| core.channels[channel.0 as usize] = MockChannel::default());
    }
    fn channel_set_endpoint(&mut self, channel: ChannelId, ep: &EndpointCharacteristics) {
        self.with(|core| core.channels[channel.0 as usize].endpoint = Some(*ep));
    }
    fn channel_activate(&mut self, channel: ChannelId, list: &[Self::Desc], start_index: usize) {
        self.with(|core| {
            core.channels[channel.0 as usize].active = true;
            core.channels[channel.0 as usize].halted = false;
            core.activations.push(Activation {
                channel: channel.0,
                start_index,
                descs: list.to_vec(),
            });
        });
    }
    fn channel_request_halt(&mut self, channel: ChannelId) -> bool {
        self.with(|core| {
            let auto_ack = core.auto_ack_halt;
            let ch = &mut core.channels[channel.0 as usize];
            if !ch.active {
                return true;
            }
            if auto_ack {
                ch.active = false;
                ch.pending_event = Some(ChannelEvent::HaltAcknowledged);
            }
            false
        })
    }
    fn channel_mark_halted(&mut self, channel: ChannelId) {
        self.with(|core| {
            core.channels[channel.0 as usize].halted = true;
            core.channels[channel.0 as usize].active = false;
        });
    }
    fn channel_set_direction(&mut self, channel: ChannelId, direction: Direction) {
        self.with(|core| core.channels[channel.0 as usize].directions.push(direction));
    }
    fn channel_set_pid(&mut self, channel: ChannelId, pid: DataPid) {
        self.with(|core| core.channels[channel.0 as usize].pids.push(pid));
    }

    fn desc_fill(
        &mut self,
        desc: &mut Self::Desc,
        data: Option<core::ptr::NonNull<u8>>,
        len: usize,
        flags: DescFlags,
    ) {
        let (remaining, status) = self.with(|core| {
            core.fill_results
                .pop_front()
                .unwrap_or((0, DescStatus::Success))
        });
        *desc = MockDesc {
            active: true,
            len,
            flags,
            has_data: data.is_some(),
            remaining,
            status,
        };
    }
    fn desc_clear(&mut self, desc: &mut Self::Desc) {
        *desc = MockDesc::default();
    }
    fn desc_parse(&self, desc: &Self::Desc) -> DescResult {
        DescResult {
            remaining: desc.remaining,
            status: desc.status,
        }
    }
}

// ------------------------------------------------------------- mock OS --

thread_local! {
    static PUMP: RefCell<Option<Box<dyn Fn()>>> = RefCell::new(None);
    static DELAY_ACTIONS: RefCell<VecDeque<Box<dyn FnOnce()>>> =
        RefCell::new(VecDeque::new());
}

/// Install the interrupt pump run inside delays and yields (usually
/// `move || host.on_interrupt()`)
pub fn set_interrupt_pump(pump: impl Fn() + 'static) {
    PUMP.with(|slot| *slot.borrow_mut() = Some(Box::new(pump)));
}

/// Queue an action to run at the start of the next `delay_ms` (e.g.
/// injecting a disconnect mid-reset)
pub fn on_next_delay(action: impl FnOnce() + 'static) {
    DELAY_ACTIONS.with(|queue| queue.borrow_mut().push_back(Box::new(action)));
}

fn pump_interrupts() {
    PUMP.with(|slot| {
        if let Some(pump) = slot.borrow().as_ref() {
            pump();
        }
    });
}

/// Test OS: delays run queued actions then pump the dispatcher; yields
/// pump the dispatcher so blocked commands can observe their wake
pub struct MockOs;

impl HostOs for MockOs {
    fn delay_ms(_ms: u32) {
        let action = DELAY_ACTIONS.with(|queue| queue.borrow_mut().pop_front());
        if let Some(action) = action {
            action();
        }
        pump_interrupts();
    }
    fn delay_us(_us: u32) {}
    fn yield_now() {
        pump_interrupts();
    }
}
