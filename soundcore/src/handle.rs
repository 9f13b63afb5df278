use std::sync::{Arc, Mutex};

use crate::device::{DeviceCapabilities, DeviceFlags, DeviceType, FormatMask, SoundDevice};
use crate::error::{Error, Result};
use crate::event::{EventState, IoEvent, WaitTimeout};
use crate::host::{DeviceState, InfoRequest, StateRequest, StreamConfig, Volume};
use crate::ring::RingBuffer;
use crate::subsystem::{DirectoryEntry, ListingStatus, SoundCore};

pub const DEFAULT_FRAGMENT_SIZE: usize = 2048;
pub const DEFAULT_FRAGMENT_COUNT: usize = 2;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_VOLUME: Volume = Volume::flat(75);

/// Occupancy report for one direction's queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueInformation {
    pub bytes_available: i32,
    pub fragments_available: i32,
    pub fragment_size: i32,
    pub fragment_count: i32,
}

/// Control operations a handle accepts.
pub enum ControlRequest {
    GetSupportedFormats,
    /// Chooses the lowest supported bit of the request; an empty
    /// intersection leaves the negotiated format alone.
    SetFormat(FormatMask),
    SetChannelCount(u32),
    /// Non-zero asks for stereo; the reply says whether stereo was chosen.
    SetStereo(u32),
    SetSampleRate(u32),
    GetInputQueueSize,
    GetOutputQueueSize,
    /// Hints at buffer geometry; only honored before the buffer exists.
    SetBufferSizeHint {
        fragment_count: u32,
        fragment_size_exponent: u32,
    },
    StopInput,
    StopOutput,
    StopAll,
    GetDeviceCapabilities,
    /// Rewrites both arming bits from the request, starting the stream if
    /// one newly appears.
    EnableDevice(DeviceFlags),
    SetVolume(Volume),
    GetVolume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlReply {
    Formats(FormatMask),
    Format(FormatMask),
    ChannelCount(u32),
    Stereo(u32),
    SampleRate(u32),
    QueueSize(QueueInformation),
    BufferSize {
        fragment_count: u32,
        fragment_size: u32,
    },
    Stopped,
    Capabilities(DeviceCapabilities),
    Enabled(DeviceFlags),
    Volume(Volume),
}

struct HandleState {
    state: DeviceState,
    ring: Option<Arc<RingBuffer>>,
    fragment_size: usize,
    fragment_count: usize,
    format: FormatMask,
    channels: u32,
    rate: u32,
    volume: Volume,
}

impl HandleState {
    fn defaults(core: &SoundCore, device: &SoundDevice) -> HandleState {
        HandleState {
            state: DeviceState::Uninitialized,
            ring: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE
                .clamp(core.min_fragment_size, core.max_fragment_size),
            fragment_count: DEFAULT_FRAGMENT_COUNT.min(core.max_fragment_count),
            format: device.formats().lowest(),
            channels: device.max_channels(),
            rate: device
                .nearest_rate(DEFAULT_SAMPLE_RATE)
                .unwrap_or(DEFAULT_SAMPLE_RATE),
            volume: DEFAULT_VOLUME,
        }
    }

    fn empty() -> HandleState {
        HandleState {
            state: DeviceState::Uninitialized,
            ring: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            fragment_count: DEFAULT_FRAGMENT_COUNT,
            format: FormatMask::empty(),
            channels: 0,
            rate: 0,
            volume: DEFAULT_VOLUME,
        }
    }
}

/// One open name under the controller: either the listing itself or an
/// exclusively held device.
///
/// The internal lock serializes lifecycle edges, negotiation, and the
/// software side of the cyclic buffer. It is never held across a wait for
/// the hardware.
pub struct SoundHandle {
    core: Arc<SoundCore>,
    device: Option<Arc<SoundDevice>>,
    event: Arc<IoEvent>,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for SoundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundHandle").finish_non_exhaustive()
    }
}

impl SoundHandle {
    pub(crate) fn open_root(core: Arc<SoundCore>) -> SoundHandle {
        core.handle_opened();
        SoundHandle {
            core,
            device: None,
            event: Arc::new(IoEvent::new()),
            state: Mutex::new(HandleState::empty()),
        }
    }

    pub(crate) fn open_device(core: Arc<SoundCore>, device: Arc<SoundDevice>) -> SoundHandle {
        let state = HandleState::defaults(&core, &device);
        Self::apply_enable_default(&device);
        core.handle_opened();
        SoundHandle {
            core,
            device: Some(device),
            event: Arc::new(IoEvent::new()),
            state: Mutex::new(state),
        }
    }

    /// Arms the device's own direction so the first transfer auto-starts,
    /// unless the controller wants arming to stay manual.
    fn apply_enable_default(device: &SoundDevice) {
        if !device
            .capabilities()
            .contains(DeviceCapabilities::MANUAL_ENABLE)
        {
            device.set_flags(device.kind().enable_flag());
        }
    }

    pub fn core(&self) -> &Arc<SoundCore> {
        &self.core
    }

    pub fn device(&self) -> Option<&Arc<SoundDevice>> {
        self.device.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.device.is_none()
    }

    pub fn state(&self) -> DeviceState {
        self.state.lock().unwrap().state
    }

    /// Current readiness, for poll-style callers.
    pub fn poll(&self) -> EventState {
        match self.device {
            None => EventState::READABLE,
            Some(_) => self.event.state(),
        }
    }

    /// Walks the device listing. Only meaningful on the root handle.
    pub fn read_directory(
        &self,
        entry_offset: usize,
        capacity: usize,
    ) -> Result<(Vec<DirectoryEntry>, ListingStatus)> {
        if self.device.is_some() {
            return Err(Error::NotSupported);
        }
        self.core.read_directory(entry_offset, capacity)
    }

    pub fn control(&self, request: ControlRequest) -> Result<ControlReply> {
        let device = self.device.as_ref().ok_or(Error::NotSupported)?;
        let mut st = self.state.lock().unwrap();

        match request {
            ControlRequest::GetSupportedFormats => Ok(ControlReply::Formats(device.formats())),
            ControlRequest::SetFormat(requested) => {
                let usable = requested & device.formats();
                if !usable.is_empty() {
                    st.format = usable.lowest();
                }
                Ok(ControlReply::Format(st.format))
            }
            ControlRequest::SetChannelCount(count) => {
                st.channels = count.clamp(device.min_channels(), device.max_channels());
                Ok(ControlReply::ChannelCount(st.channels))
            }
            ControlRequest::SetStereo(request) => {
                let stereo = request != 0 && device.max_channels() >= 2;
                let desired = if stereo { 2 } else { 1 };
                st.channels = desired.clamp(device.min_channels(), device.max_channels());
                Ok(ControlReply::Stereo(u32::from(stereo)))
            }
            ControlRequest::SetSampleRate(desired) => {
                if let Some(rate) = device.nearest_rate(desired) {
                    st.rate = rate;
                }
                Ok(ControlReply::SampleRate(st.rate))
            }
            ControlRequest::GetInputQueueSize => {
                Ok(ControlReply::QueueSize(Self::queue_information(
                    device,
                    &st,
                    DeviceType::Input,
                )))
            }
            ControlRequest::GetOutputQueueSize => {
                Ok(ControlReply::QueueSize(Self::queue_information(
                    device,
                    &st,
                    DeviceType::Output,
                )))
            }
            ControlRequest::SetBufferSizeHint {
                fragment_count,
                fragment_size_exponent,
            } => {
                if st.state == DeviceState::Uninitialized {
                    let mut size = 1usize << fragment_size_exponent.min(31);
                    size = size.clamp(self.core.min_fragment_size, self.core.max_fragment_size);

                    let mut count = (fragment_count as usize)
                        .next_power_of_two()
                        .clamp(2, self.core.max_fragment_count);

                    while size * count >= self.core.max_buffer_size && count > 2 {
                        count /= 2;
                    }
                    while size * count >= self.core.max_buffer_size
                        && size > self.core.min_fragment_size
                    {
                        size /= 2;
                    }

                    st.fragment_size = size;
                    st.fragment_count = count;
                }
                Ok(ControlReply::BufferSize {
                    fragment_count: st.fragment_count as u32,
                    fragment_size: st.fragment_size as u32,
                })
            }
            ControlRequest::StopInput => self.stop_if(device, &mut st, DeviceType::Input),
            ControlRequest::StopOutput => self.stop_if(device, &mut st, DeviceType::Output),
            ControlRequest::StopAll => {
                self.teardown(&mut st);
                *st = HandleState::defaults(&self.core, device);
                Self::apply_enable_default(device);
                Ok(ControlReply::Stopped)
            }
            ControlRequest::GetDeviceCapabilities => {
                Ok(ControlReply::Capabilities(device.capabilities()))
            }
            ControlRequest::EnableDevice(request) => {
                let mask = DeviceFlags::ENABLE_INPUT | DeviceFlags::ENABLE_OUTPUT;
                let requested = request & mask;
                let prior = device.flags() & mask;
                device.set_flags(requested);
                device.clear_flags(mask - requested);
                if !(requested - prior).is_empty() {
                    self.try_start(device, &mut st)?;
                }
                Ok(ControlReply::Enabled(device.flags() & mask))
            }
            ControlRequest::SetVolume(volume) => {
                if st.state != DeviceState::Uninitialized {
                    self.core
                        .host()
                        .get_set_info(device, InfoRequest::SetVolume(volume))?;
                }
                st.volume = volume;
                Ok(ControlReply::Volume(st.volume))
            }
            ControlRequest::GetVolume => Ok(ControlReply::Volume(st.volume)),
        }
    }

    fn queue_information(
        device: &SoundDevice,
        st: &HandleState,
        queried: DeviceType,
    ) -> QueueInformation {
        if device.kind() != queried {
            return QueueInformation::default();
        }
        let bytes = st.ring.as_ref().map(|ring| ring.available()).unwrap_or(0);
        QueueInformation {
            bytes_available: bytes as i32,
            fragments_available: (bytes / st.fragment_size) as i32,
            fragment_size: st.fragment_size as i32,
            fragment_count: st.fragment_count as i32,
        }
    }

    fn stop_if(
        &self,
        device: &Arc<SoundDevice>,
        st: &mut HandleState,
        direction: DeviceType,
    ) -> Result<ControlReply> {
        if device.kind() == direction {
            self.teardown(st);
            *st = HandleState::defaults(&self.core, device);
            Self::apply_enable_default(device);
        }
        Ok(ControlReply::Stopped)
    }

    /// Queues playback data, blocking on buffer space.
    ///
    /// Returns once every byte is queued, or with the partial count if the
    /// wait times out or the stream is torn down underneath the call.
    pub fn write(&self, buf: &[u8], timeout: WaitTimeout) -> Result<usize> {
        let device = self.device.as_ref().ok_or(Error::AccessDenied)?;
        if device.kind() != DeviceType::Output {
            return Err(Error::AccessDenied);
        }

        let mut copied = 0;
        let mut st = self.state.lock().unwrap();
        self.ensure_initialized(device, &mut st)?;

        while copied < buf.len() {
            let Some(ring) = st.ring.clone() else { break };

            let writable = ring.available();
            if writable == 0 {
                drop(st);
                match ring.event().wait(EventState::WRITABLE, timeout) {
                    Ok(()) => {}
                    Err(_) if copied > 0 => return Ok(copied),
                    Err(err) => return Err(err),
                }
                st = self.state.lock().unwrap();
                if st.state == DeviceState::Uninitialized {
                    break;
                }
                continue;
            }

            let chunk = writable.min(buf.len() - copied);
            let offset = ring.software_offset();
            ring.copy_in(offset, &buf[copied..copied + chunk]);
            ring.advance_software(chunk);
            copied += chunk;

            // First data is queued; arm the engine if it is not running yet.
            if st.state == DeviceState::Initialized {
                if let Err(err) = self.try_start(device, &mut st) {
                    log::warn!("deferred start failed: {}", err);
                }
            }
        }
        Ok(copied)
    }

    /// Pulls captured data, blocking until the buffer fills the request.
    ///
    /// Same partial-count rules as [`SoundHandle::write`].
    pub fn read(&self, buf: &mut [u8], timeout: WaitTimeout) -> Result<usize> {
        let device = self.device.as_ref().ok_or(Error::AccessDenied)?;
        if device.kind() != DeviceType::Input {
            return Err(Error::AccessDenied);
        }

        let mut copied = 0;
        let mut st = self.state.lock().unwrap();
        self.ensure_initialized(device, &mut st)?;
        if let Err(err) = self.try_start(device, &mut st) {
            log::warn!("capture start failed: {}", err);
        }

        while copied < buf.len() {
            let Some(ring) = st.ring.clone() else { break };

            let readable = ring.available();
            if readable == 0 {
                drop(st);
                match ring.event().wait(EventState::READABLE, timeout) {
                    Ok(()) => {}
                    Err(_) if copied > 0 => return Ok(copied),
                    Err(err) => return Err(err),
                }
                st = self.state.lock().unwrap();
                if st.state == DeviceState::Uninitialized {
                    break;
                }
                continue;
            }

            let chunk = readable.min(buf.len() - copied);
            let offset = ring.software_offset();
            ring.copy_out(offset, &mut buf[copied..copied + chunk]);
            ring.advance_software(chunk);
            copied += chunk;
        }
        Ok(copied)
    }

    /// Hands out a live window over the cyclic buffer, for devices that
    /// declare the capability. The window starts at `io_offset` and runs to
    /// the end of the buffer; an offset past the end reads as end-of-file.
    pub fn map_buffer(&self, io_offset: usize) -> Result<BufferWindow> {
        let device = self.device.as_ref().ok_or(Error::NotSupported)?;
        if !device
            .capabilities()
            .contains(DeviceCapabilities::MMAP)
        {
            return Err(Error::NotSupported);
        }

        let mut st = self.state.lock().unwrap();
        self.ensure_initialized(device, &mut st)?;
        let ring = st.ring.clone().ok_or(Error::DeviceIoError)?;
        let size = ring.size();
        if io_offset >= size {
            return Err(Error::EndOfFile);
        }
        Ok(BufferWindow {
            len: size - io_offset,
            offset: io_offset,
            ring,
        })
    }

    /// Tears the stream down and restores open-time defaults.
    pub fn reset(&self) -> Result<()> {
        let device = self.device.as_ref().ok_or(Error::NotSupported)?;
        let mut st = self.state.lock().unwrap();
        self.teardown(&mut st);
        *st = HandleState::defaults(&self.core, device);
        Self::apply_enable_default(device);
        Ok(())
    }

    /// Builds the cyclic buffer on the first transfer and moves the device
    /// out of the uninitialized state. Fails leave everything untouched.
    fn ensure_initialized(&self, device: &Arc<SoundDevice>, st: &mut HandleState) -> Result<()> {
        if st.state != DeviceState::Uninitialized {
            return Ok(());
        }

        let size = st.fragment_size * st.fragment_count;
        if size == 0 || size > self.core.max_buffer_size {
            return Err(Error::InvalidConfiguration);
        }

        let buffer =
            self.core
                .host()
                .alloc_dma_buffer(device, st.fragment_size, st.fragment_count)?;
        if buffer.len() < size {
            return Err(Error::InsufficientResources);
        }

        self.event.rearm();
        let ring = Arc::new(RingBuffer::new(
            buffer,
            st.fragment_size,
            st.fragment_count,
            device.kind(),
            self.event.clone(),
        ));

        let config = StreamConfig {
            ring: ring.clone(),
            format: st.format,
            channels: st.channels,
            rate: st.rate,
            volume: st.volume,
        };
        self.core
            .host()
            .get_set_info(device, InfoRequest::SetState(StateRequest::Initialized(config)))?;

        log::debug!(
            "buffer ready: {} x {} bytes, rate {} Hz, {} channels",
            st.fragment_count,
            st.fragment_size,
            st.rate,
            st.channels
        );
        st.ring = Some(ring);
        st.state = DeviceState::Initialized;
        Ok(())
    }

    /// Asks the controller to run. A clear arming bit makes this a
    /// successful no-op; repeated calls while running are idempotent.
    fn try_start(&self, device: &Arc<SoundDevice>, st: &mut HandleState) -> Result<()> {
        if st.state != DeviceState::Initialized {
            return Ok(());
        }
        if !device.enabled(device.kind()) {
            return Ok(());
        }
        self.core
            .host()
            .get_set_info(device, InfoRequest::SetState(StateRequest::Running))?;
        st.state = DeviceState::Running;
        Ok(())
    }

    /// Stops DMA, wakes any sleeper with a cancel, and releases the buffer.
    fn teardown(&self, st: &mut HandleState) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        if st.state != DeviceState::Uninitialized || st.ring.is_some() {
            if let Err(err) = self
                .core
                .host()
                .get_set_info(device, InfoRequest::SetState(StateRequest::Uninitialized))
            {
                log::error!("device stop reported {}", err);
            }
        }
        if let Some(ring) = st.ring.take() {
            ring.event().cancel();
            self.core.host().free_dma_buffer(device, &ring);
        }
        st.state = DeviceState::Uninitialized;
    }
}

impl Drop for SoundHandle {
    fn drop(&mut self) {
        if let Some(device) = self.device.clone() {
            let mut st = self.state.lock().unwrap();
            self.teardown(&mut st);
            drop(st);
            device.release();
        }
        self.core.handle_closed();
    }
}

/// Live view of a cyclic buffer's bytes.
///
/// The window is not a snapshot: DMA keeps moving under it, so two reads of
/// the same range may differ. Callers wanting stability copy out.
pub struct BufferWindow {
    ring: Arc<RingBuffer>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for BufferWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferWindow")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl BufferWindow {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bus address of the window's first byte.
    pub fn physical(&self) -> usize {
        self.ring.physical() + self.offset
    }

    /// Copies the window's current contents; returns bytes copied.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.len);
        self.ring.read_at(self.offset, &mut buf[..len])
    }
}
