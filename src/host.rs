//! Top-level host controller driver object
//!
//! [`UsbHost`] owns the HAL, the single root port, the pipe arena and all
//! shared mutable state, guarded by one short critical section usable from
//! both interrupt and task context. The critical section is never held
//! across a blocking wait: commands that must wait (reset/resume timings,
//! debounce, disable and halt confirmations) release it, block on a delay
//! or an [`EventSlot`], and re-acquire it to observe the result.
//!
//! [`UsbHost::on_interrupt`] is the single dispatcher entry point; wire it
//! to the controller's interrupt. It never blocks.

use crate::buffer::XFER_LIST_LEN_PERIODIC;
use crate::error::{HcdError, Result};
use crate::hal::{
    ChannelError, ChannelEvent, ChannelId, CoreInterrupt, FifoBias, HostHal, PortSignal, Speed,
    SyncDirection,
};
use crate::os::{CommandMutex, EventSlot, HostOs};
use crate::pipe::{
    derive_endpoint_characteristics, verify_controller_support, verify_usb_compliance, Pipe,
    PipeCallback, PipeCommand, PipeConfig, PipeEvent, PipeHandle, PipeState,
};
use crate::port::{Port, PortCallback, PortCommand, PortConfig, PortEvent, PortState};
use crate::transfer::{
    Direction, TransferStatus, TransferType, Urb, UrbState, UrbToken, SETUP_PACKET_SIZE,
};
use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use critical_section::Mutex;

/// The controller has exactly one root port
pub const NUM_PORTS: u8 = 1;

/// All state shared between task context and the interrupt dispatcher
struct HostInner<H: HostHal, const MAX_PIPES: usize> {
    hal: H,
    port: Port,
    pipes: [Option<Pipe<H>>; MAX_PIPES],
    /// Bumped whenever a pipe slot is allocated or freed, so stale
    /// [`PipeHandle`]s are rejected
    generations: [u8; MAX_PIPES],
}

impl<H: HostHal, const MAX_PIPES: usize> HostInner<H, MAX_PIPES> {
    fn pipe_index(&self, handle: PipeHandle) -> Result<usize> {
        let index = handle.index as usize;
        if index < MAX_PIPES
            && self.generations[index] == handle.generation
            && self.pipes[index].is_some()
        {
            Ok(index)
        } else {
            Err(HcdError::InvalidArgument)
        }
    }

    fn all_pipes_halted(&self) -> bool {
        self.pipes
            .iter()
            .flatten()
            .all(|pipe| pipe.state == PipeState::Halted)
    }

    fn pipe_index_for_channel(&self, channel: ChannelId) -> Option<usize> {
        self.pipes
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|pipe| pipe.channel == channel))
    }
}

/// USB host controller driver for one root port
///
/// Generic over the platform [`HostHal`], the [`HostOs`] timing services
/// and the pipe arena size (defaults to 8, a typical host channel count).
///
/// All methods take `&self`; the driver is safe to share between tasks and
/// the interrupt handler.
pub struct UsbHost<H: HostHal, O: HostOs, const MAX_PIPES: usize = 8> {
    inner: Mutex<RefCell<HostInner<H, MAX_PIPES>>>,
    /// Serializes port commands across tasks
    port_mutex: CommandMutex,
    /// Wakes a blocked Disable command
    port_slot: EventSlot,
    /// Wakes a blocked Halt command, one slot per pipe arena index
    pipe_slots: [EventSlot; MAX_PIPES],
    next_token: AtomicU32,
    _os: PhantomData<O>,
}

impl<H: HostHal, O: HostOs, const MAX_PIPES: usize> UsbHost<H, O, MAX_PIPES> {
    /// Install the driver around a platform HAL
    ///
    /// The port starts uninitialized; call [`UsbHost::port_init`] next.
    pub fn new(hal: H) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(HostInner {
                hal,
                port: Port::new(),
                pipes: core::array::from_fn(|_| None),
                generations: [0; MAX_PIPES],
            })),
            port_mutex: CommandMutex::new(),
            port_slot: EventSlot::new(),
            pipe_slots: core::array::from_fn(|_| EventSlot::new()),
            next_token: AtomicU32::new(0),
            _os: PhantomData,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut HostInner<H, MAX_PIPES>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    // ------------------------------------------------------------ port --

    /// Initialize the root port
    ///
    /// `port_number` is 1-based; the controller has exactly one port.
    /// Blocks briefly while host mode takes effect.
    pub fn port_init(&self, port_number: u8, config: PortConfig) -> Result<()> {
        if port_number == 0 {
            return Err(HcdError::InvalidArgument);
        }
        if port_number > NUM_PORTS {
            return Err(HcdError::NotFound);
        }
        let timing = config.timing;
        self.with_inner(|inner| {
            if inner.port.initialized {
                return Err(HcdError::InvalidState);
            }
            inner.port.state = PortState::NotPowered;
            inner.port.last_event = PortEvent::None;
            inner.port.flags.clear();
            inner.port.speed = None;
            inner.port.fifo_bias = config.fifo_bias;
            inner.port.timing = timing;
            inner.port.callback = config.callback;
            inner.hal.core_init();
            inner.port.initialized = true;
            // The frame list is installed and periodic scheduling enabled
            // only after a successful reset
            inner.port.frame_list.clear();
            inner.hal.interrupt_enable(true);
            Ok(())
        })?;
        O::delay_ms(timing.init_settle_ms);
        Ok(())
    }

    /// Release the root port
    ///
    /// All pipes must have been freed and the port must be unpowered or
    /// awaiting recovery.
    pub fn port_deinit(&self) -> Result<()> {
        self.with_inner(|inner| {
            if !(inner.port.initialized
                && inner.port.num_pipes() == 0
                && matches!(inner.port.state, PortState::NotPowered | PortState::Recovery)
                && !self.port_slot.is_armed())
            {
                return Err(HcdError::InvalidState);
            }
            inner.port.initialized = false;
            inner.hal.interrupt_enable(false);
            inner.hal.core_deinit();
            Ok(())
        })
    }

    /// Execute a port command
    ///
    /// Commands are serialized by the port mutex and refuse to run while an
    /// unhandled port event is pending; drain events with
    /// [`UsbHost::port_handle_event`] first. Reset, Resume and Disable
    /// block the calling task.
    pub fn port_command(&self, command: PortCommand) -> Result<()> {
        let _guard = self.port_mutex.lock::<O>();
        self.with_inner(|inner| {
            if inner.port.initialized && !inner.port.flags.event_pending {
                inner.port.flags.cmd_processing = true;
                Ok(())
            } else {
                Err(HcdError::InvalidState)
            }
        })?;
        let result = match command {
            PortCommand::PowerOn => self.port_cmd_power_on(),
            PortCommand::PowerOff => self.port_cmd_power_off(),
            PortCommand::Reset => self.port_cmd_reset(),
            PortCommand::Suspend => self.port_cmd_suspend(),
            PortCommand::Resume => self.port_cmd_resume(),
            PortCommand::Disable => self.port_cmd_disable(),
        };
        self.with_inner(|inner| inner.port.flags.cmd_processing = false);
        result
    }

    fn port_cmd_power_on(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.port.state != PortState::NotPowered {
                return Err(HcdError::InvalidState);
            }
            inner.port.state = PortState::Disconnected;
            inner.hal.port_init();
            inner.hal.port_set_power(true);
            Ok(())
        })
    }

    fn port_cmd_power_off(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.port.state == PortState::NotPowered {
                return Err(HcdError::InvalidState);
            }
            inner.port.state = PortState::NotPowered;
            inner.hal.port_deinit();
            inner.hal.port_set_power(false);
            // A connected device will raise a disconnect event from here
            Ok(())
        })
    }

    fn port_cmd_reset(&self) -> Result<()> {
        let timing = self.with_inner(|inner| inner.port.timing);
        // Assert the bus reset. If the port was enabled, a disabled event
        // will follow; the Resetting state tells the dispatcher to ignore
        // it.
        self.with_inner(|inner| {
            if !matches!(inner.port.state, PortState::Enabled | PortState::Disabled) {
                return Err(HcdError::InvalidState);
            }
            if inner.port.num_pipes_queued > 0 {
                return Err(HcdError::InvalidState);
            }
            inner.port.state = PortState::Resetting;
            inner.hal.port_assert_reset(true);
            Ok(())
        })?;
        O::delay_ms(timing.reset_hold_ms);
        let mut result = self.with_inner(|inner| {
            if inner.port.state != PortState::Resetting {
                return Err(HcdError::CommandInvalidated);
            }
            inner.hal.port_assert_reset(false);
            Ok(())
        });
        if result.is_ok() {
            O::delay_ms(timing.reset_recovery_ms);
            result = self.with_inner(|inner| {
                if inner.port.state != PortState::Enabled || !inner.port.flags.conn_dev_ena {
                    return Err(HcdError::CommandInvalidated);
                }
                // The reset wiped these registers
                let bias = inner.port.fifo_bias;
                inner.hal.set_fifo_bias(bias);
                inner.hal.install_frame_list(&inner.port.frame_list);
                inner.hal.periodic_enable();
                Ok(())
            });
        }
        // Channel characteristics are re-applied regardless of outcome
        self.with_inner(|inner| {
            for index in 0..MAX_PIPES {
                if let Some(pipe) = inner.pipes[index].as_ref() {
                    inner.hal.channel_set_endpoint(pipe.channel, &pipe.ep);
                }
            }
            inner.hal.sync_frame_list(&inner.port.frame_list);
        });
        result
    }

    fn port_cmd_suspend(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.port.state != PortState::Enabled || !inner.all_pipes_halted() {
                return Err(HcdError::InvalidState);
            }
            inner.hal.port_suspend();
            inner.port.state = PortState::Suspended;
            Ok(())
        })
    }

    fn port_cmd_resume(&self) -> Result<()> {
        let timing = self.with_inner(|inner| inner.port.timing);
        self.with_inner(|inner| {
            if inner.port.state != PortState::Suspended {
                return Err(HcdError::InvalidState);
            }
            // Put and hold the bus in the K state
            inner.hal.port_assert_resume(true);
            inner.port.state = PortState::Resuming;
            Ok(())
        })?;
        O::delay_ms(timing.resume_hold_ms);
        self.with_inner(|inner| {
            inner.hal.port_assert_resume(false);
            if inner.port.state != PortState::Resuming || !inner.port.flags.conn_dev_ena {
                return Err(HcdError::CommandInvalidated);
            }
            Ok(())
        })?;
        O::delay_ms(timing.resume_recovery_ms);
        self.with_inner(|inner| {
            if inner.port.state != PortState::Resuming || !inner.port.flags.conn_dev_ena {
                return Err(HcdError::CommandInvalidated);
            }
            inner.port.state = PortState::Enabled;
            Ok(())
        })
    }

    fn port_cmd_disable(&self) -> Result<()> {
        // Arm before requesting the disable; the dispatcher's confirmation
        // must find a waiter
        let waiter = self.port_slot.arm()?;
        let started = self.with_inner(|inner| {
            if !matches!(inner.port.state, PortState::Enabled | PortState::Suspended) {
                return Err(HcdError::InvalidState);
            }
            if !inner.all_pipes_halted() {
                return Err(HcdError::InvalidState);
            }
            inner.port.flags.disable_requested = true;
            inner.hal.port_disable();
            Ok(())
        });
        if let Err(error) = started {
            drop(waiter);
            return Err(error);
        }
        waiter.wait::<O>();
        self.with_inner(|inner| {
            if inner.port.state != PortState::Disabled {
                return Err(HcdError::CommandInvalidated);
            }
            Ok(())
        })
    }

    /// Current port state
    pub fn port_state(&self) -> PortState {
        self.with_inner(|inner| inner.port.state)
    }

    /// Speed of the connected, enabled device
    pub fn port_speed(&self) -> Result<Speed> {
        self.with_inner(|inner| {
            if !inner.port.flags.conn_dev_ena {
                return Err(HcdError::InvalidState);
            }
            Ok(inner.hal.port_speed())
        })
    }

    /// Drain and process exactly one pending port event
    ///
    /// Connection events are debounced here: after the delay the physical
    /// state is re-sampled, and a connection that did not survive returns
    /// [`PortEvent::None`]. Blocks for the debounce delay.
    pub fn port_handle_event(&self) -> PortEvent {
        let _guard = self.port_mutex.lock::<O>();
        let (event, debounce_ms) = self.with_inner(|inner| {
            if inner.port.initialized && inner.port.flags.event_pending {
                inner.port.flags.event_pending = false;
                inner.port.flags.event_processing = true;
                (inner.port.last_event, inner.port.timing.debounce_ms)
            } else {
                (PortEvent::None, 0)
            }
        });
        let result = match event {
            PortEvent::None => return PortEvent::None,
            PortEvent::Connection => {
                if self.debounce_connection(debounce_ms) {
                    PortEvent::Connection
                } else {
                    PortEvent::None
                }
            }
            other => other,
        };
        self.with_inner(|inner| inner.port.flags.event_processing = false);
        result
    }

    /// Delay, then re-sample whether a device is really present
    fn debounce_connection(&self, debounce_ms: u32) -> bool {
        let powered = self.with_inner(|inner| inner.port.state != PortState::NotPowered);
        if !powered {
            // Disconnect raced via power off; nothing to debounce
            return false;
        }
        O::delay_ms(debounce_ms);
        self.with_inner(|inner| {
            let connected = inner.hal.port_connected();
            inner.port.state = if connected {
                PortState::Disabled
            } else {
                PortState::Disconnected
            };
            inner.hal.port_clear_debounce_lock();
            connected
        })
    }

    /// Return a port in [`PortState::Recovery`] to [`PortState::NotPowered`]
    ///
    /// Requires every pipe to have been freed and no flags pending. Performs
    /// a full controller soft reset.
    pub fn port_recover(&self) -> Result<()> {
        self.with_inner(|inner| {
            if !(inner.port.initialized
                && inner.port.state == PortState::Recovery
                && inner.port.num_pipes() == 0
                && inner.port.flags.all_clear()
                && !self.port_slot.is_armed())
            {
                return Err(HcdError::InvalidState);
            }
            // The soft reset wipes every register; keep the interrupt
            // gated throughout
            inner.hal.interrupt_enable(false);
            inner.hal.core_soft_reset();
            inner.port.state = PortState::NotPowered;
            inner.port.last_event = PortEvent::None;
            inner.port.flags.clear();
            inner.port.speed = None;
            inner.hal.core_init();
            inner.port.frame_list.clear();
            inner.hal.interrupt_enable(true);
            Ok(())
        })
    }

    /// Rebias the controller FIFOs; only legal with no allocated pipes
    pub fn port_set_fifo_bias(&self, bias: FifoBias) -> Result<()> {
        let _guard = self.port_mutex.lock::<O>();
        self.with_inner(|inner| {
            if inner.port.initialized
                && !inner.port.flags.event_pending
                && inner.port.num_pipes() == 0
            {
                inner.hal.set_fifo_bias(bias);
                inner.port.fifo_bias = bias;
                Ok(())
            } else {
                Err(HcdError::InvalidState)
            }
        })
    }

    // ------------------------------------------------------------ pipe --

    /// Allocate a pipe to one endpoint of the connected device
    ///
    /// The port must hold an enabled (reset) device. With no endpoint
    /// descriptor the default control pipe is built with the worst-case
    /// MPS for the device speed.
    pub fn pipe_alloc(&self, config: PipeConfig) -> Result<PipeHandle> {
        let (port_speed, pipe_index, limits) = self.with_inner(|inner| {
            if !(inner.port.initialized && inner.port.flags.conn_dev_ena) {
                return Err(HcdError::InvalidState);
            }
            let speed = inner.port.speed.ok_or(HcdError::InvalidState)?;
            Ok((speed, inner.port.num_pipes(), inner.hal.mps_limits()))
        })?;
        let transfer_type = config
            .endpoint
            .map_or(TransferType::Control, |ep| ep.transfer_type);
        if !verify_usb_compliance(config.device_speed, port_speed, transfer_type) {
            return Err(HcdError::Unsupported);
        }
        // The default pipe has no descriptor to check against the limits
        if let Some(endpoint) = &config.endpoint {
            if !verify_controller_support(&limits, endpoint) {
                return Err(HcdError::Unsupported);
            }
        }
        let ep = derive_endpoint_characteristics(&config, transfer_type, pipe_index, port_speed);

        self.with_inner(|inner| {
            // The device may have vanished while we were verifying
            if !(inner.port.initialized && inner.port.flags.conn_dev_ena) {
                return Err(HcdError::InvalidState);
            }
            let Some(slot_index) = inner.pipes.iter().position(|slot| slot.is_none()) else {
                return Err(HcdError::NoResources);
            };
            let Some(channel) = inner.hal.channel_alloc() else {
                return Err(HcdError::Unsupported);
            };
            inner.hal.channel_set_endpoint(channel, &ep);
            inner.hal.sync_frame_list(&inner.port.frame_list);
            inner.pipes[slot_index] = Some(Pipe::new(channel, ep, config.callback));
            inner.generations[slot_index] = inner.generations[slot_index].wrapping_add(1);
            inner.port.num_pipes_idle += 1;
            Ok(PipeHandle {
                index: slot_index as u8,
                generation: inner.generations[slot_index],
            })
        })
    }

    /// Free a pipe
    ///
    /// Every URB must have been dequeued and nothing may be executing.
    pub fn pipe_free(&self, handle: PipeHandle) -> Result<()> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            if pipe.ring.is_executing() || pipe.has_urb {
                return Err(HcdError::InvalidState);
            }
            let channel = pipe.channel;
            inner.hal.channel_free(channel);
            inner.pipes[index] = None;
            inner.generations[index] = inner.generations[index].wrapping_add(1);
            inner.port.num_pipes_idle -= 1;
            Ok(())
        })
    }

    /// Execute a pipe command
    ///
    /// Halt blocks the calling task if a buffer is executing; Flush may run
    /// the pipe callback synchronously in the caller's context.
    pub fn pipe_command(&self, handle: PipeHandle, command: PipeCommand) -> Result<()> {
        match command {
            PipeCommand::Halt => self.pipe_cmd_halt(handle),
            PipeCommand::Flush => self.pipe_cmd_flush(handle),
            PipeCommand::Clear => self.pipe_cmd_clear(handle),
        }
    }

    fn pipe_cmd_halt(&self, handle: PipeHandle) -> Result<()> {
        let index = handle.index as usize;
        if index >= MAX_PIPES {
            return Err(HcdError::InvalidArgument);
        }
        // Arm up front so the dispatcher's acknowledgment always finds the
        // waiter; disarmed below if no wait turns out to be needed
        let waiter = self.pipe_slots[index].arm()?;
        let needs_wait = self.with_inner(|inner| {
            inner.pipe_index(handle)?;
            let conn_dev_ena = inner.port.flags.conn_dev_ena;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            pipe.cmd_processing = true;
            if pipe.state == PipeState::Halted {
                return Ok(false);
            }
            let channel = pipe.channel;
            // With no enabled device there is nothing on the bus to halt
            if conn_dev_ena && !inner.hal.channel_request_halt(channel) {
                let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
                pipe.waiting_halt = true;
                Ok(true)
            } else {
                inner.hal.channel_mark_halted(channel);
                let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
                pipe.state = PipeState::Halted;
                Ok(false)
            }
        });
        let result = match needs_wait {
            Ok(true) => {
                waiter.wait::<O>();
                self.with_inner(|inner| {
                    if let Some(pipe) = inner.pipes[index].as_ref() {
                        debug_assert_eq!(pipe.state, PipeState::Halted);
                    }
                });
                Ok(())
            }
            Ok(false) => {
                drop(waiter);
                Ok(())
            }
            Err(error) => {
                drop(waiter);
                Err(error)
            }
        };
        self.with_inner(|inner| {
            if inner.pipe_index(handle).is_ok() {
                if let Some(pipe) = inner.pipes[index].as_mut() {
                    pipe.cmd_processing = false;
                }
            }
        });
        result
    }

    fn pipe_cmd_flush(&self, handle: PipeHandle) -> Result<()> {
        let callback = self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let conn_dev_ena = inner.port.flags.conn_dev_ena;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            if pipe.state != PipeState::Halted {
                return Err(HcdError::InvalidState);
            }
            pipe.cmd_processing = true;
            // With a live device this is a cancellation; without one the
            // URBs report the device loss
            let canceled = conn_dev_ena;
            let mut callback_needed = pipe.buffer_flush_all(&mut inner.hal, canceled);
            let status = if canceled {
                TransferStatus::Canceled
            } else {
                TransferStatus::NoDevice
            };
            // Never-executed URBs go straight to the done queue with zero
            // actual length
            while let Some(mut urb) = pipe.pending.pop_front() {
                urb.state = UrbState::Done;
                urb.actual_num_bytes = 0;
                urb.status = Some(status);
                for packet in urb.isoc_packets.iter_mut() {
                    packet.actual_num_bytes = 0;
                    packet.status = Some(status);
                }
                let pushed = pipe.done.push_back(urb);
                debug_assert!(pushed.is_ok());
                callback_needed = true;
            }
            Ok(if callback_needed { pipe.callback } else { None })
        })?;
        // The one command allowed to run the callback synchronously
        if let Some(callback) = callback {
            callback(handle, PipeEvent::UrbDone, false);
        }
        self.with_inner(|inner| {
            if let Ok(index) = inner.pipe_index(handle) {
                if let Some(pipe) = inner.pipes[index].as_mut() {
                    pipe.cmd_processing = false;
                }
            }
        });
        Ok(())
    }

    fn pipe_cmd_clear(&self, handle: PipeHandle) -> Result<()> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let conn_dev_ena = inner.port.flags.conn_dev_ena;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            // Reactivation needs a device to talk to
            if pipe.state != PipeState::Halted || !conn_dev_ena {
                return Err(HcdError::InvalidState);
            }
            pipe.cmd_processing = true;
            pipe.state = PipeState::Active;
            while pipe.can_fill() {
                pipe.buffer_fill::<O>(&mut inner.hal);
            }
            if pipe.can_exec() {
                pipe.buffer_exec(&mut inner.hal);
            }
            pipe.cmd_processing = false;
            Ok(())
        })
    }

    /// Current pipe state
    pub fn pipe_state(&self, handle: PipeHandle) -> Result<PipeState> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_ref().ok_or(HcdError::InvalidArgument)?;
            Ok(pipe.state)
        })
    }

    /// Read and clear the pipe's last event
    pub fn pipe_event(&self, handle: PipeHandle) -> Result<PipeEvent> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            let event = pipe.last_event;
            pipe.last_event = PipeEvent::None;
            Ok(event)
        })
    }

    /// The pipe's current maximum packet size
    pub fn pipe_mps(&self, handle: PipeHandle) -> Result<u16> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_ref().ok_or(HcdError::InvalidArgument)?;
            Ok(pipe.ep.mps)
        })
    }

    /// URBs currently held by the pipe (pending plus done)
    pub fn pipe_num_urbs(&self, handle: PipeHandle) -> Result<usize> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_ref().ok_or(HcdError::InvalidArgument)?;
            Ok(pipe.pending.len() + pipe.done.len())
        })
    }

    /// Update the pipe's MPS after enumeration learns the real EP0 size
    ///
    /// Only legal while no URB is held and no command is in progress.
    pub fn pipe_update_mps(&self, handle: PipeHandle, mps: u16) -> Result<()> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            if pipe.cmd_processing || pipe.has_urb {
                return Err(HcdError::InvalidState);
            }
            pipe.ep.mps = mps;
            let channel = pipe.channel;
            let ep = pipe.ep;
            inner.hal.channel_set_endpoint(channel, &ep);
            Ok(())
        })
    }

    /// Update the pipe's device address after SET_ADDRESS
    ///
    /// Only legal while no URB is held and no command is in progress.
    pub fn pipe_update_device_address(&self, handle: PipeHandle, address: u8) -> Result<()> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            if pipe.cmd_processing || pipe.has_urb {
                return Err(HcdError::InvalidState);
            }
            pipe.ep.device_address = address;
            let channel = pipe.channel;
            let ep = pipe.ep;
            inner.hal.channel_set_endpoint(channel, &ep);
            Ok(())
        })
    }

    // ------------------------------------------------------------- urb --

    /// Enqueue an URB on a pipe
    ///
    /// Fails unless the port is enabled and the pipe active. On rejection
    /// the URB is handed back alongside the error. On success the returned
    /// token identifies the URB for [`UsbHost::urb_abort`].
    pub fn urb_enqueue(
        &self,
        handle: PipeHandle,
        mut urb: Urb,
    ) -> core::result::Result<UrbToken, (HcdError, Urb)> {
        if urb.state != UrbState::Idle {
            return Err((HcdError::InvalidState, urb));
        }
        let token = UrbToken(self.next_token.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
        self.with_inner(move |inner| {
            let index = match inner.pipe_index(handle) {
                Ok(index) => index,
                Err(error) => return Err((error, urb)),
            };
            if inner.port.state != PortState::Enabled {
                return Err((HcdError::InvalidState, urb));
            }
            let Some(pipe) = inner.pipes[index].as_ref() else {
                return Err((HcdError::InvalidArgument, urb));
            };
            if pipe.state != PipeState::Active || pipe.cmd_processing {
                return Err((HcdError::InvalidState, urb));
            }
            let ep = pipe.ep;
            if pipe.pending.is_full() {
                return Err((HcdError::NoResources, urb));
            }
            // Per-type admission checks
            match ep.transfer_type {
                TransferType::Control => {
                    if urb.num_bytes() < SETUP_PACKET_SIZE || !urb.isoc_packets().is_empty() {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                }
                TransferType::Bulk => {
                    if !urb.isoc_packets().is_empty() {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                }
                TransferType::Interrupt => {
                    if !urb.isoc_packets().is_empty() || urb.num_bytes() == 0 {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                    let mps = ep.mps as usize;
                    // IN interrupt transfers must divide evenly into packets
                    if ep.address.direction() == Direction::In && urb.num_bytes() % mps != 0 {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                    let num_descs = urb.num_bytes().div_ceil(mps);
                    if num_descs + 1 > XFER_LIST_LEN_PERIODIC {
                        return Err((HcdError::TransferTooLarge, urb));
                    }
                }
                TransferType::Isochronous => {
                    if urb.isoc_packets().is_empty() {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                    // A long interval with many packets may not fit the
                    // descriptor list
                    let interval = (ep.periodic.interval as usize).clamp(1, XFER_LIST_LEN_PERIODIC);
                    if urb.isoc_packets().len() * interval > XFER_LIST_LEN_PERIODIC {
                        return Err((HcdError::TransferTooLarge, urb));
                    }
                    let total: usize = urb.isoc_packets().iter().map(|p| p.num_bytes).sum();
                    if total > urb.num_bytes() {
                        return Err((HcdError::InvalidArgument, urb));
                    }
                }
            }
            // Hand the caller's data to the controller: OUT and control
            // transfers carry host-written bytes
            let is_in = ep.address.direction() == Direction::In;
            let is_control = ep.transfer_type == TransferType::Control;
            if !is_in || is_control {
                let len = urb.data().len();
                let ptr = urb.data_ptr(0);
                inner.hal.sync_data_buffer(ptr, len, SyncDirection::ToDevice);
            }
            urb.token = token;
            urb.state = UrbState::Pending;
            urb.status = None;
            urb.actual_num_bytes = 0;

            let pipe = match inner.pipes[index].as_mut() {
                Some(pipe) => pipe,
                None => return Err((HcdError::InvalidArgument, urb)),
            };
            if let Err(urb) = pipe.pending.push_back(urb) {
                // Capacity was verified above
                return Err((HcdError::NoResources, urb));
            }
            if pipe.can_fill() {
                pipe.buffer_fill::<O>(&mut inner.hal);
            }
            if pipe.can_exec() {
                pipe.buffer_exec(&mut inner.hal);
            }
            if !pipe.has_urb {
                // First URB held by this pipe: it leaves the idle set
                pipe.has_urb = true;
                inner.port.num_pipes_idle -= 1;
                inner.port.num_pipes_queued += 1;
            }
            Ok(token)
        })
    }

    /// Dequeue the next retired URB from the pipe's done queue
    pub fn urb_dequeue(&self, handle: PipeHandle) -> Result<Option<Urb>> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            let Some(mut urb) = pipe.done.pop_front() else {
                return Ok(None);
            };
            debug_assert_eq!(urb.state, UrbState::Done);
            urb.state = UrbState::Idle;
            let is_in = pipe.ep.address.direction() == Direction::In;
            let is_control = pipe.ep.transfer_type == TransferType::Control;
            let drained = pipe.pending.is_empty()
                && pipe.done.is_empty()
                && pipe.ring.num_to_exec() == 0
                && pipe.ring.num_to_parse() == 0;
            if pipe.has_urb && drained {
                // Last URB left: the pipe returns to the idle set
                pipe.has_urb = false;
                inner.port.num_pipes_queued -= 1;
                inner.port.num_pipes_idle += 1;
            }
            // Device-written bytes become visible to the caller here
            if is_in || is_control {
                let len = urb.data().len();
                let ptr = urb.data_ptr(0);
                inner.hal.sync_data_buffer(ptr, len, SyncDirection::FromDevice);
            }
            Ok(Some(urb))
        })
    }

    /// Abort a still-pending URB, retiring it as canceled
    ///
    /// In-flight and already-done URBs are left untouched; an unknown token
    /// is an error.
    pub fn urb_abort(&self, handle: PipeHandle, token: UrbToken) -> Result<()> {
        self.with_inner(|inner| {
            let index = inner.pipe_index(handle)?;
            let pipe = inner.pipes[index].as_mut().ok_or(HcdError::InvalidArgument)?;
            let pending_len = pipe.pending.len();
            let mut found = false;
            // Rotate through the pending queue once, retiring the match
            // and preserving the order of everything else
            for _ in 0..pending_len {
                let Some(mut urb) = pipe.pending.pop_front() else {
                    break;
                };
                if !found && urb.token == token {
                    found = true;
                    urb.state = UrbState::Done;
                    urb.actual_num_bytes = 0;
                    urb.status = Some(TransferStatus::Canceled);
                    for packet in urb.isoc_packets.iter_mut() {
                        packet.actual_num_bytes = 0;
                        packet.status = Some(TransferStatus::Canceled);
                    }
                    let pushed = pipe.done.push_back(urb);
                    debug_assert!(pushed.is_ok());
                } else {
                    let pushed = pipe.pending.push_back(urb);
                    debug_assert!(pushed.is_ok());
                }
            }
            if found {
                return Ok(());
            }
            let known = pipe.ring.contains_urb(token)
                || pipe.done.iter().any(|urb| urb.token == token);
            if known {
                // Too late to abort; the URB will retire through the
                // normal path
                Ok(())
            } else {
                Err(HcdError::UrbNotFound)
            }
        })
    }

    // ------------------------------------------------------ dispatcher --

    /// Interrupt dispatcher; wire this to the controller interrupt
    ///
    /// Decodes whether the interrupt is port- or channel-level, drives the
    /// port and buffer state machines accordingly, and invokes port/pipe
    /// callbacks with the critical section released. Never blocks.
    pub fn on_interrupt(&self) {
        let first = self.with_inner(|inner| inner.hal.decode_interrupt());
        match first {
            CoreInterrupt::Channel => loop {
                // One channel per critical section; callbacks run between
                let step = self.with_inner(|inner| {
                    let channel = inner.hal.next_pending_channel()?;
                    Some(self.handle_channel(inner, channel))
                });
                match step {
                    None => break,
                    Some(None) => continue,
                    Some(Some((callback, handle, event))) => callback(handle, event, true),
                }
            },
            CoreInterrupt::Port(signal) => {
                let pending = self.with_inner(|inner| self.handle_port_signal(inner, signal));
                if let Some((callback, event)) = pending {
                    callback(event, true);
                }
            }
            CoreInterrupt::None => {}
        }
    }

    /// Drive one channel's event through the buffer pipeline
    ///
    /// Returns the callback to invoke once the critical section is
    /// released, if the event is user-visible.
    fn handle_channel(
        &self,
        inner: &mut HostInner<H, MAX_PIPES>,
        channel: ChannelId,
    ) -> Option<(PipeCallback, PipeHandle, PipeEvent)> {
        let Some(index) = inner.pipe_index_for_channel(channel) else {
            debug_assert!(false, "interrupt from a channel with no pipe");
            return None;
        };
        let handle = PipeHandle {
            index: index as u8,
            generation: inner.generations[index],
        };
        let event = inner.hal.channel_decode_interrupt(channel);
        let conn_dev_ena = inner.port.flags.conn_dev_ena;
        let pipe = inner.pipes[index].as_mut()?;
        let user_event = match event {
            ChannelEvent::Completed => {
                if !pipe.buffer_check_done() {
                    // Mid-control-transfer: re-arm the next stage without
                    // consuming a new URB
                    pipe.buffer_exec_cont(&mut inner.hal);
                    return None;
                }
                pipe.last_event = PipeEvent::UrbDone;
                let stop_index = inner.hal.channel_stop_index(channel);
                pipe.buffer_done(stop_index, PipeEvent::UrbDone, false);
                // Keep the channel busy before parsing, but only while a
                // valid device remains
                if pipe.can_exec() && conn_dev_ena {
                    pipe.buffer_exec(&mut inner.hal);
                }
                pipe.buffer_parse(&mut inner.hal);
                if pipe.can_fill() && conn_dev_ena {
                    pipe.buffer_fill::<O>(&mut inner.hal);
                }
                PipeEvent::UrbDone
            }
            ChannelEvent::Error => {
                let error = inner.hal.channel_error(channel);
                let user_event = match error {
                    ChannelError::Transaction => PipeEvent::ErrorTransfer,
                    ChannelError::BufferNotAvailable => PipeEvent::ErrorUrbNotAvailable,
                    ChannelError::Babble => PipeEvent::ErrorOverflow,
                    ChannelError::Stall => PipeEvent::ErrorStall,
                };
                pipe.last_event = user_event;
                // Error events force the pipe to halt
                pipe.state = PipeState::Halted;
                let stop_index = inner.hal.channel_stop_index(channel);
                pipe.buffer_done(stop_index, user_event, false);
                pipe.buffer_parse(&mut inner.hal);
                user_event
            }
            ChannelEvent::HaltAcknowledged => {
                debug_assert!(pipe.waiting_halt);
                // The halted transfer still retires its URB
                pipe.last_event = PipeEvent::UrbDone;
                pipe.state = PipeState::Halted;
                let stop_index = inner.hal.channel_stop_index(channel);
                pipe.buffer_done(stop_index, PipeEvent::None, true);
                pipe.buffer_parse(&mut inner.hal);
                pipe.waiting_halt = false;
                self.pipe_slots[index].notify();
                PipeEvent::UrbDone
            }
            ChannelEvent::None => return None,
        };
        pipe.callback.map(|callback| (callback, handle, user_event))
    }

    /// Update port state for a port-level signal
    ///
    /// Returns the callback to invoke once the critical section is
    /// released, if an event must be propagated.
    fn handle_port_signal(
        &self,
        inner: &mut HostInner<H, MAX_PIPES>,
        signal: PortSignal,
    ) -> Option<(PortCallback, PortEvent)> {
        let mut event = PortEvent::None;
        match signal {
            PortSignal::Connect => {
                // State is not updated yet; the connection must survive
                // debounce first
                event = PortEvent::Connection;
            }
            PortSignal::Disconnect => {
                inner.port.state = PortState::Recovery;
                inner.port.flags.conn_dev_ena = false;
                event = PortEvent::Disconnection;
                self.force_halt_all_pipes(inner);
            }
            PortSignal::Enabled => {
                inner.hal.port_enable();
                inner.port.speed = Some(inner.hal.port_speed());
                inner.port.state = PortState::Enabled;
                inner.port.flags.conn_dev_ena = true;
                // Triggered by a reset command; no event to propagate
            }
            PortSignal::Disabled => {
                inner.port.flags.conn_dev_ena = false;
                // A disable during reset is the expected side effect of
                // asserting the reset signal
                if inner.port.state != PortState::Resetting {
                    if inner.port.flags.disable_requested {
                        inner.port.state = PortState::Disabled;
                        inner.port.flags.disable_requested = false;
                        self.port_slot.notify();
                    } else {
                        inner.port.state = PortState::Recovery;
                        event = PortEvent::Error;
                        self.force_halt_all_pipes(inner);
                    }
                }
            }
            PortSignal::Overcurrent | PortSignal::OvercurrentCleared => {
                if inner.port.state != PortState::NotPowered {
                    // Cut power to protect the port
                    inner.hal.port_set_power(false);
                    inner.port.state = PortState::Recovery;
                    event = PortEvent::Overcurrent;
                    self.force_halt_all_pipes(inner);
                }
                inner.port.flags.conn_dev_ena = false;
            }
        }
        if event == PortEvent::None {
            return None;
        }
        #[cfg(feature = "defmt")]
        if event != PortEvent::Connection {
            defmt::warn!("fatal port event, port needs recovery");
        }
        inner.port.last_event = event;
        inner.port.flags.event_pending = true;
        inner.port.callback.map(|callback| (callback, event))
    }

    /// A fatal port event invalidates every routed pipe: finish in-flight
    /// work as NO_DEVICE, leave every pipe halted and wake any blocked
    /// halt command
    fn force_halt_all_pipes(&self, inner: &mut HostInner<H, MAX_PIPES>) {
        for index in 0..MAX_PIPES {
            let Some(pipe) = inner.pipes[index].as_mut() else {
                continue;
            };
            if pipe.ring.is_executing() {
                let channel = pipe.channel;
                inner.hal.channel_mark_halted(channel);
                pipe.buffer_done(0, PipeEvent::None, false);
                pipe.buffer_parse(&mut inner.hal);
            }
            pipe.state = PipeState::Halted;
            if pipe.waiting_halt {
                pipe.waiting_halt = false;
                self.pipe_slots[index].notify();
            }
        }
    }
}
