//! End-to-end exercises of the core against a scripted controller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use soundcore::{
    ControlReply, ControlRequest, DeviceCapabilities, DeviceFlags, DeviceState, DeviceType, Error,
    EventState, FormatMask, HostInterface, HostRegistration, InfoReply, InfoRequest, ListingStatus,
    QueueInformation, Result, RingBuffer, SoundCore, SoundDevice, StateRequest, Volume,
    WaitTimeout, SUBSYSTEM_VERSION,
};

#[derive(Default)]
struct ScriptedHost {
    initialize_calls: AtomicUsize,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    fail_initialize: AtomicBool,
    fail_running: AtomicBool,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    volume: Mutex<Option<Volume>>,
}

impl ScriptedHost {
    fn ring(&self) -> Option<Arc<RingBuffer>> {
        self.ring.lock().unwrap().clone()
    }

    /// Spins until the controller saw a run request, then returns the ring.
    fn wait_for_running(&self) -> Arc<RingBuffer> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.run_calls.load(Ordering::Acquire) == 0 {
            assert!(Instant::now() < deadline, "stream never started");
            thread::sleep(Duration::from_millis(1));
        }
        self.ring().expect("running without a buffer")
    }
}

impl HostInterface for ScriptedHost {
    fn get_set_info(&self, _device: &Arc<SoundDevice>, request: InfoRequest) -> Result<InfoReply> {
        match request {
            InfoRequest::SetState(StateRequest::Initialized(config)) => {
                if self.fail_initialize.load(Ordering::Acquire) {
                    return Err(Error::InsufficientResources);
                }
                self.initialize_calls.fetch_add(1, Ordering::AcqRel);
                *self.ring.lock().unwrap() = Some(config.ring.clone());
                Ok(InfoReply::Done)
            }
            InfoRequest::SetState(StateRequest::Running) => {
                if self.fail_running.load(Ordering::Acquire) {
                    return Err(Error::ResourceInUse);
                }
                self.run_calls.fetch_add(1, Ordering::AcqRel);
                Ok(InfoReply::Done)
            }
            InfoRequest::SetState(StateRequest::Uninitialized) => {
                self.stop_calls.fetch_add(1, Ordering::AcqRel);
                *self.ring.lock().unwrap() = None;
                Ok(InfoReply::Done)
            }
            InfoRequest::GetState => Ok(InfoReply::State(DeviceState::Uninitialized)),
            InfoRequest::SetVolume(volume) => {
                *self.volume.lock().unwrap() = Some(volume);
                Ok(InfoReply::Done)
            }
            InfoRequest::GetVolume => Ok(InfoReply::Volume(
                self.volume.lock().unwrap().unwrap_or(Volume::flat(75)),
            )),
        }
    }
}

fn fixture() -> (Arc<SoundCore>, Arc<ScriptedHost>) {
    let host = Arc::new(ScriptedHost::default());
    let devices = vec![
        Arc::new(SoundDevice::new(
            DeviceType::Output,
            FormatMask::PCM16 | FormatMask::PCM32,
            1,
            2,
            vec![8000, 16000, 22050, 44100, 48000],
            DeviceCapabilities::MMAP
                | DeviceCapabilities::INTERFACE_ANALOG
                | DeviceCapabilities::CHANNEL_STEREO,
            Vec::new(),
            0,
        )),
        Arc::new(SoundDevice::new(
            DeviceType::Input,
            FormatMask::PCM16,
            1,
            2,
            vec![8000, 16000, 44100, 48000],
            DeviceCapabilities::INTERFACE_ANALOG | DeviceCapabilities::CHANNEL_STEREO,
            Vec::new(),
            1,
        )),
    ];
    let registration = HostRegistration {
        min_fragment_size: 128,
        max_fragment_size: 0x4000,
        max_fragment_count: 8,
        max_buffer_size: 0x10000,
        noncached_dma: false,
        devices,
    };
    let core = SoundCore::new(host.clone(), registration).unwrap();
    (core, host)
}

#[test]
fn playback_write_wraps_and_starts_once() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();

    let pump = {
        let host = host.clone();
        thread::spawn(move || {
            let ring = host.wait_for_running();
            // First fragment completes.
            ring.update_hardware(2048);
            thread::sleep(Duration::from_millis(5));
            // Second fragment completes; position wraps to the start.
            ring.update_hardware(0);
        })
    };

    let data = vec![0x5Au8; 4096];
    let written = handle.write(&data, WaitTimeout::Indefinite).unwrap();
    pump.join().unwrap();

    assert_eq!(written, 4096);
    assert_eq!(handle.state(), DeviceState::Running);
    assert_eq!(host.run_calls.load(Ordering::Acquire), 1);
    assert_eq!(host.initialize_calls.load(Ordering::Acquire), 1);
    // The producer cursor wrapped exactly back to zero.
    assert_eq!(host.ring().unwrap().software_offset(), 0);
}

#[test]
fn capture_queue_report_before_any_read() {
    let (core, _host) = fixture();
    let handle = core.open("input").unwrap();

    let reply = handle.control(ControlRequest::GetInputQueueSize).unwrap();
    assert_eq!(
        reply,
        ControlReply::QueueSize(QueueInformation {
            bytes_available: 0,
            fragments_available: 0,
            fragment_size: 2048,
            fragment_count: 2,
        })
    );

    // Direction mismatch reads back zero-filled.
    let reply = handle.control(ControlRequest::GetOutputQueueSize).unwrap();
    assert_eq!(reply, ControlReply::QueueSize(QueueInformation::default()));
}

#[test]
fn sample_rate_snaps_to_nearest() {
    let (core, _host) = fixture();
    let handle = core.open("output0").unwrap();

    let reply = handle.control(ControlRequest::SetSampleRate(17000)).unwrap();
    assert_eq!(reply, ControlReply::SampleRate(16000));

    let reply = handle.control(ControlRequest::SetSampleRate(48000)).unwrap();
    assert_eq!(reply, ControlReply::SampleRate(48000));
}

#[test]
fn format_negotiation_is_idempotent() {
    let (core, _host) = fixture();
    let handle = core.open("output0").unwrap();

    let request = FormatMask::PCM16 | FormatMask::PCM32;
    let first = handle.control(ControlRequest::SetFormat(request)).unwrap();
    assert_eq!(first, ControlReply::Format(FormatMask::PCM16));
    let second = handle.control(ControlRequest::SetFormat(request)).unwrap();
    assert_eq!(second, first);

    // Unsupported requests leave the negotiated format alone.
    let reply = handle
        .control(ControlRequest::SetFormat(FormatMask::FLOAT32))
        .unwrap();
    assert_eq!(reply, ControlReply::Format(FormatMask::PCM16));
}

#[test]
fn stereo_and_channel_negotiation() {
    let (core, _host) = fixture();
    let handle = core.open("output0").unwrap();

    assert_eq!(
        handle.control(ControlRequest::SetStereo(1)).unwrap(),
        ControlReply::Stereo(1)
    );
    assert_eq!(
        handle.control(ControlRequest::SetStereo(0)).unwrap(),
        ControlReply::Stereo(0)
    );
    assert_eq!(
        handle.control(ControlRequest::SetChannelCount(16)).unwrap(),
        ControlReply::ChannelCount(2)
    );
    assert_eq!(
        handle.control(ControlRequest::SetChannelCount(0)).unwrap(),
        ControlReply::ChannelCount(1)
    );
}

#[test]
fn buffer_hint_clamps_to_controller_limits() {
    let (core, _host) = fixture();
    let handle = core.open("output0").unwrap();

    // Too few fragments, reasonable size.
    let reply = handle
        .control(ControlRequest::SetBufferSizeHint {
            fragment_count: 1,
            fragment_size_exponent: 10,
        })
        .unwrap();
    assert_eq!(
        reply,
        ControlReply::BufferSize {
            fragment_count: 2,
            fragment_size: 1024,
        }
    );

    // Degenerate size rounds up to the controller minimum.
    let reply = handle
        .control(ControlRequest::SetBufferSizeHint {
            fragment_count: 2,
            fragment_size_exponent: 0,
        })
        .unwrap();
    assert_eq!(
        reply,
        ControlReply::BufferSize {
            fragment_count: 2,
            fragment_size: 128,
        }
    );

    // Oversized request clamps down until the total fits.
    let reply = handle
        .control(ControlRequest::SetBufferSizeHint {
            fragment_count: 100,
            fragment_size_exponent: 31,
        })
        .unwrap();
    assert_eq!(
        reply,
        ControlReply::BufferSize {
            fragment_count: 2,
            fragment_size: 0x4000,
        }
    );
}

#[test]
fn buffer_hint_ignored_once_initialized() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();

    // Prime the buffer without blocking.
    handle.write(&[0u8; 64], WaitTimeout::Millis(0)).unwrap();
    assert_ne!(handle.state(), DeviceState::Uninitialized);
    let _ = host;

    let reply = handle
        .control(ControlRequest::SetBufferSizeHint {
            fragment_count: 8,
            fragment_size_exponent: 8,
        })
        .unwrap();
    // Still the negotiated geometry, untouched.
    assert_eq!(
        reply,
        ControlReply::BufferSize {
            fragment_count: 2,
            fragment_size: 2048,
        }
    );
}

#[test]
fn second_open_is_refused_until_close() {
    let (core, _host) = fixture();
    let first = core.open("output0").unwrap();
    assert_eq!(core.open("output0").unwrap_err(), Error::ResourceInUse);
    assert_eq!(core.open("output").unwrap_err(), Error::ResourceInUse);
    drop(first);
    let retry = core.open("output0").unwrap();
    drop(retry);
}

#[test]
fn lookup_failures() {
    let (core, _host) = fixture();
    assert_eq!(core.open("input5").unwrap_err(), Error::NotFound);
    assert_eq!(core.open("pcm0").unwrap_err(), Error::NotFound);
    assert_eq!(core.open("input9999999999999999999").unwrap_err(), Error::NotFound);
    assert_eq!(core.open("outputX").unwrap_err(), Error::NotFound);
}

#[test]
fn directory_walk_orders_and_resumes() {
    let (core, _host) = fixture();
    let root = core.open("/").unwrap();

    let (entries, status) = root.read_directory(0, 16).unwrap();
    assert_eq!(status, ListingStatus::Complete);
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["input0", "output0", "input", "output"]);

    // A short buffer reports there is more, and the cursor resumes.
    let (first, status) = root.read_directory(0, 2).unwrap();
    assert_eq!(status, ListingStatus::MoreProcessingRequired);
    assert_eq!(first.len(), 2);
    let resume = first.last().unwrap().next_offset;
    let (rest, status) = root.read_directory(resume, 16).unwrap();
    assert_eq!(status, ListingStatus::Complete);
    assert_eq!(rest[0].name, "input");

    // Exhausted cursor reads as end-of-file.
    assert_eq!(root.read_directory(4, 16).unwrap_err(), Error::EndOfFile);
}

#[test]
fn root_handle_rejects_device_operations() {
    let (core, _host) = fixture();
    let root = core.open("").unwrap();
    assert_eq!(
        root.control(ControlRequest::GetSupportedFormats).unwrap_err(),
        Error::NotSupported
    );
    assert_eq!(
        root.write(&[0u8; 4], WaitTimeout::Millis(0)).unwrap_err(),
        Error::AccessDenied
    );
    assert!(root.poll().contains(EventState::READABLE));
}

#[test]
fn information_record_checks_version() {
    let (core, _host) = fixture();
    assert_eq!(core.information(0).unwrap_err(), Error::InvalidParameter);
    let info = core.information(SUBSYSTEM_VERSION).unwrap();
    assert_eq!(info.input_device_count, 1);
    assert_eq!(info.output_device_count, 1);
    assert_eq!(info.flags, 0);
}

#[test]
fn direction_mismatch_is_denied() {
    let (core, _host) = fixture();
    let output = core.open("output0").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(
        output.read(&mut buf, WaitTimeout::Millis(0)).unwrap_err(),
        Error::AccessDenied
    );
    drop(output);

    let input = core.open("input0").unwrap();
    assert_eq!(
        input.write(&buf, WaitTimeout::Millis(0)).unwrap_err(),
        Error::AccessDenied
    );
}

#[test]
fn capture_read_times_out_without_data_when_disarmed() {
    let (core, host) = fixture();
    let handle = core.open("input0").unwrap();

    // Disarm; the start request becomes a successful no-op.
    let reply = handle
        .control(ControlRequest::EnableDevice(DeviceFlags::empty()))
        .unwrap();
    assert_eq!(reply, ControlReply::Enabled(DeviceFlags::empty()));

    let mut buf = [0u8; 64];
    assert_eq!(
        handle.read(&mut buf, WaitTimeout::Millis(10)).unwrap_err(),
        Error::Timeout
    );
    assert_eq!(host.run_calls.load(Ordering::Acquire), 0);
    assert_eq!(handle.state(), DeviceState::Initialized);

    // Rearming starts the engine.
    let reply = handle
        .control(ControlRequest::EnableDevice(DeviceFlags::ENABLE_INPUT))
        .unwrap();
    assert_eq!(reply, ControlReply::Enabled(DeviceFlags::ENABLE_INPUT));
    assert_eq!(host.run_calls.load(Ordering::Acquire), 1);
    assert_eq!(handle.state(), DeviceState::Running);
}

#[test]
fn capture_read_drains_posted_data() {
    let (core, host) = fixture();
    let handle = core.open("input0").unwrap();

    let pump = {
        let host = host.clone();
        thread::spawn(move || {
            let ring = host.wait_for_running();
            // Hardware posts one fragment of captured samples.
            let samples: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
            ring.copy_in(0, &samples);
            ring.update_hardware(2048);
        })
    };

    let mut buf = vec![0u8; 2048];
    let read = handle.read(&mut buf, WaitTimeout::Indefinite).unwrap();
    pump.join().unwrap();

    assert_eq!(read, 2048);
    assert_eq!(buf[0], 0);
    assert_eq!(buf[100], 100);
    // The consumer cursor caught up to the hardware cursor.
    assert_eq!(host.ring().unwrap().software_offset(), 2048);
    assert_eq!(host.ring().unwrap().available(), 0);
}

#[test]
fn stop_cancels_a_blocked_writer() {
    let (core, host) = fixture();
    let handle = Arc::new(core.open("output0").unwrap());

    let writer = {
        let handle = handle.clone();
        thread::spawn(move || handle.write(&[1u8; 100_000], WaitTimeout::Indefinite))
    };

    host.wait_for_running();
    thread::sleep(Duration::from_millis(20));
    handle.control(ControlRequest::StopOutput).unwrap();

    // The writer surfaces the bytes it managed to queue.
    let written = writer.join().unwrap().unwrap();
    assert_eq!(written, 4095);
    assert_eq!(handle.state(), DeviceState::Uninitialized);
    assert!(host.stop_calls.load(Ordering::Acquire) >= 1);

    // The handle is reusable with fresh defaults.
    let reply = handle.control(ControlRequest::GetOutputQueueSize).unwrap();
    assert_eq!(
        reply,
        ControlReply::QueueSize(QueueInformation {
            bytes_available: 0,
            fragments_available: 0,
            fragment_size: 2048,
            fragment_count: 2,
        })
    );
    let written = handle.write(&[2u8; 64], WaitTimeout::Millis(50)).unwrap();
    assert_eq!(written, 64);
}

#[test]
fn stop_of_other_direction_is_a_no_op() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();
    handle.write(&[0u8; 64], WaitTimeout::Millis(0)).unwrap();
    handle.control(ControlRequest::StopInput).unwrap();
    assert_ne!(handle.state(), DeviceState::Uninitialized);
    assert_eq!(host.stop_calls.load(Ordering::Acquire), 0);
}

#[test]
fn failed_initialization_leaves_state_untouched() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();

    host.fail_initialize.store(true, Ordering::Release);
    assert_eq!(
        handle.write(&[0u8; 16], WaitTimeout::Millis(0)).unwrap_err(),
        Error::InsufficientResources
    );
    assert_eq!(handle.state(), DeviceState::Uninitialized);

    host.fail_initialize.store(false, Ordering::Release);
    assert_eq!(handle.write(&[0u8; 16], WaitTimeout::Millis(0)).unwrap(), 16);
    assert_eq!(handle.state(), DeviceState::Running);
}

#[test]
fn failed_start_keeps_handle_initialized() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();

    host.fail_running.store(true, Ordering::Release);
    // The write itself succeeds; the deferred start is only attempted.
    assert_eq!(handle.write(&[0u8; 16], WaitTimeout::Millis(0)).unwrap(), 16);
    assert_eq!(handle.state(), DeviceState::Initialized);

    host.fail_running.store(false, Ordering::Release);
    assert_eq!(handle.write(&[0u8; 16], WaitTimeout::Millis(0)).unwrap(), 16);
    assert_eq!(handle.state(), DeviceState::Running);
}

#[test]
fn buffer_window_is_capability_gated() {
    let (core, _host) = fixture();
    let output = core.open("output0").unwrap();

    let window = output.map_buffer(0).unwrap();
    assert_eq!(window.len(), 4096);
    let mut probe = [0xFFu8; 16];
    assert_eq!(window.read(&mut probe), 16);
    assert_eq!(probe, [0u8; 16]);

    assert_eq!(output.map_buffer(4096).unwrap_err(), Error::EndOfFile);
    let tail = output.map_buffer(4000).unwrap();
    assert_eq!(tail.len(), 96);
    drop(output);

    let input = core.open("input0").unwrap();
    assert_eq!(input.map_buffer(0).unwrap_err(), Error::NotSupported);
}

#[test]
fn volume_forwarding() {
    let (core, host) = fixture();
    let handle = core.open("output0").unwrap();

    assert_eq!(
        handle.control(ControlRequest::GetVolume).unwrap(),
        ControlReply::Volume(Volume::flat(75))
    );

    // Not yet initialized; the level is only recorded.
    handle
        .control(ControlRequest::SetVolume(Volume { left: 40, right: 60 }))
        .unwrap();
    assert!(host.volume.lock().unwrap().is_none());

    handle.write(&[0u8; 32], WaitTimeout::Millis(0)).unwrap();
    handle
        .control(ControlRequest::SetVolume(Volume { left: 10, right: 20 }))
        .unwrap();
    assert_eq!(
        *host.volume.lock().unwrap(),
        Some(Volume { left: 10, right: 20 })
    );
}

#[test]
fn open_accounting_follows_handles() {
    let (core, _host) = fixture();
    assert_eq!(core.open_handle_count(), 0);
    let a = core.open("").unwrap();
    let b = core.open("output0").unwrap();
    assert_eq!(core.open_handle_count(), 2);
    drop(a);
    drop(b);
    assert_eq!(core.open_handle_count(), 0);
}
