//! End-to-end driver tests over the mock HAL
//!
//! Each test builds a host around a scripted mock controller, walks the
//! port to the enabled state, and drives transfers by injecting channel
//! and port interrupts.

mod common;

use common::{set_interrupt_pump, on_next_delay, MockHal, MockOs};
use usbh_hcd::hal::{ChannelError, DataPid, DescStatus, Speed};
use usbh_hcd::pipe::{EndpointDescriptor, PipeCommand, PipeConfig, PipeEvent, PipeState};
use usbh_hcd::port::{PortCommand, PortConfig, PortEvent, PortState};
use usbh_hcd::transfer::{
    Direction, EndpointAddress, SetupPacket, TransferStatus, TransferType, Urb, UrbFlags,
};
use usbh_hcd::{HcdError, UsbHost};

type TestHost = UsbHost<MockHal, MockOs, 8>;

fn leak_buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// Install the driver, power the port, attach a device and reset it
fn enabled_host(device_speed: Speed) -> (&'static TestHost, MockHal) {
    let hal = MockHal::new();
    let host: &'static TestHost = Box::leak(Box::new(UsbHost::new(hal.clone())));
    set_interrupt_pump(move || host.on_interrupt());

    host.port_init(1, PortConfig::default()).unwrap();
    host.port_command(PortCommand::PowerOn).unwrap();
    assert_eq!(host.port_state(), PortState::Disconnected);

    hal.attach_device(device_speed);
    host.on_interrupt();
    assert_eq!(host.port_handle_event(), PortEvent::Connection);
    assert_eq!(host.port_state(), PortState::Disabled);

    host.port_command(PortCommand::Reset).unwrap();
    assert_eq!(host.port_state(), PortState::Enabled);
    assert_eq!(host.port_speed().unwrap(), device_speed);
    (host, hal)
}

fn default_pipe_config(device_speed: Speed) -> PipeConfig {
    PipeConfig {
        endpoint: None,
        device_address: 0,
        device_speed,
        callback: None,
    }
}

fn bulk_out_config(mps: u16) -> PipeConfig {
    PipeConfig {
        endpoint: Some(EndpointDescriptor {
            address: EndpointAddress::new(2, Direction::Out),
            transfer_type: TransferType::Bulk,
            max_packet_size: mps,
            interval: 0,
        }),
        device_address: 1,
        device_speed: Speed::Full,
        callback: None,
    }
}

#[test]
fn control_transfer_runs_three_stages_on_one_urb() {
    let (host, hal) = enabled_host(Speed::Low);
    let pipe = host.pipe_alloc(default_pipe_config(Speed::Low)).unwrap();
    assert_eq!(host.pipe_mps(pipe).unwrap(), 8);

    // GET_DESCRIPTOR with an 8 byte IN data stage
    let buf = leak_buffer(16);
    SetupPacket::get_descriptor(0x01, 0, 0, 8).write_to(&mut buf[..8]);
    let urb = Urb::new(buf, 16).unwrap();
    host.urb_enqueue(pipe, urb).unwrap();

    // Setup stage armed immediately: start index 0, direction OUT, DATA0
    assert_eq!(hal.num_activations(), 1);
    let setup = hal.activation(0);
    assert_eq!(setup.start_index, 0);
    hal.with(|core| {
        assert_eq!(core.channels[0].directions.last(), Some(&Direction::Out));
        assert_eq!(core.channels[0].pids.last(), Some(&DataPid::Data0));
    });

    // Stage 0 completes: the driver re-arms stage 1 (IN, DATA1) without
    // consuming another URB
    hal.complete_channel(0);
    host.on_interrupt();
    assert_eq!(hal.num_activations(), 2);
    let data = hal.activation(1);
    assert_eq!(data.start_index, 1);
    hal.with(|core| {
        assert_eq!(core.channels[0].directions.last(), Some(&Direction::In));
        assert_eq!(core.channels[0].pids.last(), Some(&DataPid::Data1));
    });
    assert!(host.urb_dequeue(pipe).unwrap().is_none());

    // Stage 1 completes: status stage is OUT, zero length
    hal.complete_channel(0);
    host.on_interrupt();
    assert_eq!(hal.num_activations(), 3);
    let status = hal.activation(2);
    assert_eq!(status.start_index, 2);
    hal.with(|core| {
        assert_eq!(core.channels[0].directions.last(), Some(&Direction::Out));
    });

    // Stage 2 completes: the URB retires with both stages' bytes counted
    hal.complete_channel(0);
    host.on_interrupt();
    assert_eq!(host.pipe_event(pipe).unwrap(), PipeEvent::UrbDone);
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Completed));
    assert_eq!(done.actual_num_bytes(), 16);
    assert_eq!(host.urb_dequeue(pipe).unwrap().map(|_| ()), None);
}

#[test]
fn control_transfer_without_data_stage_skips_to_status() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(default_pipe_config(Speed::Full)).unwrap();

    let buf = leak_buffer(8);
    SetupPacket::set_address(5).write_to(&mut buf[..8]);
    let urb = Urb::new(buf, 8).unwrap();
    host.urb_enqueue(pipe, urb).unwrap();
    assert_eq!(hal.activation(0).start_index, 0);

    // The stage sequence is exactly 0, 2: the null data descriptor is
    // jumped over and the status stage is IN
    hal.complete_channel(0);
    host.on_interrupt();
    assert_eq!(hal.num_activations(), 2);
    assert_eq!(hal.activation(1).start_index, 2);
    hal.with(|core| {
        assert_eq!(core.channels[0].directions.last(), Some(&Direction::In));
    });

    hal.complete_channel(0);
    host.on_interrupt();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Completed));
    assert_eq!(done.actual_num_bytes(), 8);
}

#[test]
fn bulk_out_zero_length_packet_needs_exact_multiple() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();

    // 64 bytes with the ZLP flag: two descriptors, data then ZLP
    let urb = Urb::new(leak_buffer(64), 64)
        .unwrap()
        .with_flags(UrbFlags::ZERO_PACKET);
    host.urb_enqueue(pipe, urb).unwrap();
    let activation = hal.activation(0);
    assert_eq!(activation.descs.len(), 2);
    assert_eq!(activation.descs[0].len, 64);
    assert!(activation.descs[0].has_data);
    assert_eq!(activation.descs[1].len, 0);
    assert!(!activation.descs[1].has_data);

    hal.complete_channel(0);
    host.on_interrupt();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.actual_num_bytes(), 64);

    // 63 bytes: no ZLP even with the flag set, a single descriptor
    let urb = Urb::new(leak_buffer(63), 63)
        .unwrap()
        .with_flags(UrbFlags::ZERO_PACKET);
    host.urb_enqueue(pipe, urb).unwrap();
    let activation = hal.last_activation();
    assert_eq!(activation.descs.len(), 1);
    assert_eq!(activation.descs[0].len, 63);

    hal.complete_channel(0);
    host.on_interrupt();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.actual_num_bytes(), 63);
}

#[test]
fn halt_retires_only_the_executing_buffer_then_flush_cancels_the_rest() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();

    // Three URBs: the first executes, the second fills the other ring
    // slot, the third stays pending
    for _ in 0..3 {
        let urb = Urb::new(leak_buffer(64), 64).unwrap();
        host.urb_enqueue(pipe, urb).unwrap();
    }
    assert_eq!(hal.num_activations(), 1);
    assert_eq!(host.pipe_num_urbs(pipe).unwrap(), 1); // one still pending

    // Halt blocks until the in-flight buffer's hardware halt is
    // acknowledged, then retires only that URB
    host.pipe_command(pipe, PipeCommand::Halt).unwrap();
    assert_eq!(host.pipe_state(pipe).unwrap(), PipeState::Halted);

    let first = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(first.status(), Some(TransferStatus::Canceled));
    assert_eq!(first.actual_num_bytes(), 0);
    // The never-executed URBs are not done yet
    assert!(host.urb_dequeue(pipe).unwrap().is_none());

    // Flush retires the filled-but-never-executed buffer and the pending
    // URB, all canceled with zero length; the pipe stays halted
    host.pipe_command(pipe, PipeCommand::Flush).unwrap();
    for _ in 0..2 {
        let urb = host.urb_dequeue(pipe).unwrap().unwrap();
        assert_eq!(urb.status(), Some(TransferStatus::Canceled));
        assert_eq!(urb.actual_num_bytes(), 0);
    }
    assert!(host.urb_dequeue(pipe).unwrap().is_none());
    assert_eq!(host.pipe_state(pipe).unwrap(), PipeState::Halted);

    // Clear resumes the pipeline
    host.pipe_command(pipe, PipeCommand::Clear).unwrap();
    assert_eq!(host.pipe_state(pipe).unwrap(), PipeState::Active);
    host.pipe_free(pipe).unwrap();
}

#[test]
fn reset_interrupted_by_disconnect_reports_invalidated() {
    let (host, hal) = enabled_host(Speed::Full);

    // The device vanishes while the reset hold delay is running
    let hal_for_action = hal.clone();
    on_next_delay(move || hal_for_action.detach_device());
    let result = host.port_command(PortCommand::Reset);
    assert_eq!(result, Err(HcdError::CommandInvalidated));
    assert_ne!(host.port_state(), PortState::Resetting);
    assert_eq!(host.port_state(), PortState::Recovery);
    assert_eq!(host.port_handle_event(), PortEvent::Disconnection);

    // Recovery returns the port to NotPowered
    host.port_recover().unwrap();
    assert_eq!(host.port_state(), PortState::NotPowered);
}

#[test]
fn interrupt_in_short_packet_is_sized_from_the_stop_index() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host
        .pipe_alloc(PipeConfig {
            endpoint: Some(EndpointDescriptor {
                address: EndpointAddress::new(3, Direction::In),
                transfer_type: TransferType::Interrupt,
                max_packet_size: 64,
                interval: 1,
            }),
            device_address: 1,
            device_speed: Speed::Full,
            callback: None,
        })
        .unwrap();

    // 192 bytes = 3 packets; the device answers the third with 40 bytes
    hal.with(|core| {
        core.fill_results.extend([
            (0, DescStatus::Success),
            (0, DescStatus::Success),
            (24, DescStatus::Success),
        ]);
    });
    let urb = Urb::new(leak_buffer(192), 192).unwrap();
    host.urb_enqueue(pipe, urb).unwrap();
    assert_eq!(hal.activation(0).descs.len(), 3);

    hal.complete_channel_short(0, 3);
    host.on_interrupt();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Completed));
    // 2 full packets plus the 40 byte short one
    assert_eq!(done.actual_num_bytes(), 64 * 2 + 40);
}

#[test]
fn interrupt_in_length_must_divide_into_packets() {
    let (host, _hal) = enabled_host(Speed::Full);
    let pipe = host
        .pipe_alloc(PipeConfig {
            endpoint: Some(EndpointDescriptor {
                address: EndpointAddress::new(3, Direction::In),
                transfer_type: TransferType::Interrupt,
                max_packet_size: 64,
                interval: 1,
            }),
            device_address: 1,
            device_speed: Speed::Full,
            callback: None,
        })
        .unwrap();
    let urb = Urb::new(leak_buffer(100), 100).unwrap();
    let (error, _urb) = host.urb_enqueue(pipe, urb).unwrap_err();
    assert_eq!(error, HcdError::InvalidArgument);
}

#[test]
fn isochronous_buffers_tile_the_schedule_back_to_back() {
    let (host, hal) = enabled_host(Speed::Full);
    hal.with(|core| {
        core.frame_number = 10;
        core.frame_time_remaining = 1000; // plenty left in this frame
    });
    let pipe = host
        .pipe_alloc(PipeConfig {
            endpoint: Some(EndpointDescriptor {
                address: EndpointAddress::new(4, Direction::Out),
                transfer_type: TransferType::Isochronous,
                max_packet_size: 64,
                interval: 3, // decodes to every 4 frames
            }),
            device_address: 1,
            device_speed: Speed::Full,
            callback: None,
        })
        .unwrap();

    let mut first = Urb::new(leak_buffer(128), 128).unwrap();
    first.push_isoc_packet(64).unwrap();
    first.push_isoc_packet(64).unwrap();
    host.urb_enqueue(pipe, first).unwrap();

    let mut second = Urb::new(leak_buffer(128), 128).unwrap();
    second.push_isoc_packet(64).unwrap();
    second.push_isoc_packet(64).unwrap();
    host.urb_enqueue(pipe, second).unwrap();

    // First buffer: frame 10 + 1 rounded up to the interval boundary
    let first_activation = hal.activation(0);
    assert_eq!(first_activation.start_index, 12);
    assert_eq!(first_activation.active_indices(), vec![12, 16]);

    // Second buffer executes after the first completes and must continue
    // exactly where the first left off
    hal.complete_channel(0);
    host.on_interrupt();
    assert_eq!(hal.num_activations(), 2);
    let second_activation = hal.activation(1);
    assert_eq!(second_activation.start_index, 20);
    assert_eq!(second_activation.active_indices(), vec![20, 24]);

    // No schedule slot is claimed by both buffers
    for index in first_activation.active_indices() {
        assert!(!second_activation.active_indices().contains(&index));
    }

    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Completed));
    assert_eq!(done.actual_num_bytes(), 128);
    assert!(done.isoc_packets().iter().all(|p| p.status() == Some(TransferStatus::Completed)));
}

#[test]
fn stall_halts_the_pipe_and_reports_through_the_urb() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();
    let urb = Urb::new(leak_buffer(64), 64).unwrap();
    host.urb_enqueue(pipe, urb).unwrap();

    hal.fail_channel(0, ChannelError::Stall);
    host.on_interrupt();

    assert_eq!(host.pipe_state(pipe).unwrap(), PipeState::Halted);
    assert_eq!(host.pipe_event(pipe).unwrap(), PipeEvent::ErrorStall);
    // Reading the event clears it
    assert_eq!(host.pipe_event(pipe).unwrap(), PipeEvent::None);
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Stall));
    assert_eq!(done.actual_num_bytes(), 0);
    // Enqueueing on a halted pipe is refused
    let urb = Urb::new(leak_buffer(64), 64).unwrap();
    let (error, _urb) = host.urb_enqueue(pipe, urb).unwrap_err();
    assert_eq!(error, HcdError::InvalidState);
}

#[test]
fn abort_retires_a_pending_urb_only() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();

    let executing = host.urb_enqueue(pipe, Urb::new(leak_buffer(64), 64).unwrap()).unwrap();
    let _filled = host.urb_enqueue(pipe, Urb::new(leak_buffer(64), 64).unwrap()).unwrap();
    let pending = host.urb_enqueue(pipe, Urb::new(leak_buffer(64), 64).unwrap()).unwrap();

    // The pending URB aborts to the done queue as canceled
    host.urb_abort(pipe, pending).unwrap();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Canceled));

    // The in-flight one is too late to abort, but not an error
    host.urb_abort(pipe, executing).unwrap();
    assert!(host.urb_dequeue(pipe).unwrap().is_none());

    hal.complete_channel(0);
    host.on_interrupt();
    let done = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(done.status(), Some(TransferStatus::Completed));
}

#[test]
fn disconnect_halts_pipes_and_flush_reports_no_device() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();
    for _ in 0..2 {
        host.urb_enqueue(pipe, Urb::new(leak_buffer(64), 64).unwrap()).unwrap();
    }

    hal.detach_device();
    host.on_interrupt();
    assert_eq!(host.port_state(), PortState::Recovery);
    // The dispatcher forced the pipe to halt and retired the in-flight URB
    assert_eq!(host.pipe_state(pipe).unwrap(), PipeState::Halted);
    let first = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(first.status(), Some(TransferStatus::NoDevice));

    // Flushing with no device marks the remainder NoDevice, not Canceled
    host.pipe_command(pipe, PipeCommand::Flush).unwrap();
    let second = host.urb_dequeue(pipe).unwrap().unwrap();
    assert_eq!(second.status(), Some(TransferStatus::NoDevice));

    // Clear is refused without a device; free + recover completes teardown
    assert_eq!(host.pipe_command(pipe, PipeCommand::Clear), Err(HcdError::InvalidState));
    assert_eq!(host.port_handle_event(), PortEvent::Disconnection);
    host.pipe_free(pipe).unwrap();
    host.port_recover().unwrap();
    assert_eq!(host.port_state(), PortState::NotPowered);
}

#[test]
fn suspend_resume_and_disable_round_trip() {
    let (host, _hal) = enabled_host(Speed::Full);

    host.port_command(PortCommand::Suspend).unwrap();
    assert_eq!(host.port_state(), PortState::Suspended);

    host.port_command(PortCommand::Resume).unwrap();
    assert_eq!(host.port_state(), PortState::Enabled);

    // Disable blocks until the dispatcher confirms the transition
    host.port_command(PortCommand::Disable).unwrap();
    assert_eq!(host.port_state(), PortState::Disabled);
}

#[test]
fn commands_are_refused_while_an_event_is_pending() {
    let hal = MockHal::new();
    let host: &'static TestHost = Box::leak(Box::new(UsbHost::new(hal.clone())));
    set_interrupt_pump(move || host.on_interrupt());
    host.port_init(1, PortConfig::default()).unwrap();
    host.port_command(PortCommand::PowerOn).unwrap();

    hal.attach_device(Speed::Full);
    host.on_interrupt();
    // The connect event must be drained before any command may run
    assert_eq!(host.port_command(PortCommand::Reset), Err(HcdError::InvalidState));
    assert_eq!(host.port_handle_event(), PortEvent::Connection);
    host.port_command(PortCommand::Reset).unwrap();
    assert_eq!(host.port_state(), PortState::Enabled);
}

#[test]
fn stale_pipe_handles_are_rejected() {
    let (host, _hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(bulk_out_config(64)).unwrap();
    host.pipe_free(pipe).unwrap();
    assert_eq!(host.pipe_state(pipe), Err(HcdError::InvalidArgument));

    // A new pipe may reuse the arena slot; the old handle stays dead
    let replacement = host.pipe_alloc(bulk_out_config(64)).unwrap();
    assert_eq!(host.pipe_state(pipe), Err(HcdError::InvalidArgument));
    assert_eq!(host.pipe_state(replacement).unwrap(), PipeState::Active);
}

#[test]
fn pipe_updates_require_an_idle_pipe() {
    let (host, hal) = enabled_host(Speed::Full);
    let pipe = host.pipe_alloc(default_pipe_config(Speed::Full)).unwrap();

    let buf = leak_buffer(8);
    SetupPacket::set_address(7).write_to(&mut buf[..8]);
    host.urb_enqueue(pipe, Urb::new(buf, 8).unwrap()).unwrap();
    // URB still held: updates refused
    assert_eq!(host.pipe_update_device_address(pipe, 7), Err(HcdError::InvalidState));

    hal.complete_channel(0); // setup
    host.on_interrupt();
    hal.complete_channel(0); // status
    host.on_interrupt();
    host.urb_dequeue(pipe).unwrap().unwrap();

    host.pipe_update_device_address(pipe, 7).unwrap();
    host.pipe_update_mps(pipe, 64).unwrap();
    assert_eq!(host.pipe_mps(pipe).unwrap(), 64);
}
