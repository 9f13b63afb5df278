use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::io::Io;
use common::timeout::Timeout;

use soundcore::{
    AudioBuffer, DeviceCapabilities, DeviceState, DeviceType, Error, HostInterface,
    HostRegistration, InfoReply, InfoRequest, Result, Route, SoundCore, SoundDevice, StateRequest,
    StreamConfig, Volume,
};

use crate::cmdbuff::{CodecAddr, CommandRing, COMMAND_REGS_OFFSET};
use crate::graph::{self, CodecGraph, FunctionGroup, WidgetPath};
use crate::node::{supported_formats, supported_rates, verb};
use crate::regs::{
    stream_descriptor_offset, ControllerCaps, ControllerRegs, StreamDescriptorRegs, CIE, CIS,
    CRST, GIE, GIS, SD_BCIS, SD_DESE, SD_FIFOE, STREAM_INT_MASK,
};
use crate::stream::{format_word, StreamPool, StreamRuntime, BDL_ENTRIES};

/// Link DMA alignment dictates the smallest fragment.
pub const MIN_FRAGMENT_SIZE: usize = 128;
pub const MAX_FRAGMENT_SIZE: usize = 0x4_0000;
pub const MAX_BUFFER_SIZE: usize = 0x20_0000;

// Controllers whose ring DMA is unreliable; driven through the immediate
// command registers instead.
const IMMEDIATE_ONLY_IDS: &[u32] = &[0x8086_2668];

/// One published converter: where it lives and the paths that reach it,
/// primary first.
struct EndpointInfo {
    codec: CodecAddr,
    graph: usize,
    group: usize,
    nid: u16,
    direction: DeviceType,
    paths: Vec<WidgetPath>,
}

/// Mutable per-endpoint transfer state.
struct EndpointRuntime {
    state: DeviceState,
    config: Option<StreamConfig>,
    slot: Option<usize>,
    volume: Volume,
}

struct ControllerState {
    pool: StreamPool,
    streams: Vec<Option<StreamRuntime>>,
    endpoints: Vec<EndpointRuntime>,
}

/// The High Definition Audio host controller.
///
/// `irq` runs in interrupt context: it only reads and acknowledges
/// hardware status and accumulates pending work in atomic words.
/// `dispatch` drains that work from a schedulable context, moving ring
/// cursors and waking sleepers.
pub struct Controller {
    base: usize,
    caps: ControllerCaps,
    regs: spin::Mutex<&'static mut ControllerRegs>,
    cmd: CommandRing,
    state: spin::Mutex<ControllerState>,
    graphs: Vec<CodecGraph>,
    endpoints: Vec<EndpointInfo>,
    devices: Vec<Arc<SoundDevice>>,
    pending_complete: AtomicU32,
    pending_error: AtomicU32,
    interrupt_count: AtomicUsize,
}

impl Controller {
    /// Brings the controller up behind an already-mapped register window:
    /// full link reset, command rings, interrupts, then codec enumeration.
    ///
    /// `vendor_device` is the PCI id, packed vendor-high, used for quirk
    /// selection.
    pub unsafe fn new(base: usize, vendor_device: u32) -> Result<Arc<Controller>> {
        let regs = &mut *(base as *mut ControllerRegs);
        let caps =
            ControllerCaps::decode(regs.gcap.read(), regs.vmaj.read(), regs.vmin.read());
        log::info!(
            "controller {:04X}:{:04X} link {}.{}: {} input / {} output / {} bidirectional streams, 64-bit: {}",
            vendor_device >> 16,
            vendor_device & 0xFFFF,
            caps.version_major,
            caps.version_minor,
            caps.input_streams,
            caps.output_streams,
            caps.bidirectional_streams,
            caps.addressing_64bit
        );

        let cmd = CommandRing::new(base + COMMAND_REGS_OFFSET)?;
        let statests = reset_controller(regs, &cmd)?;

        cmd.init(IMMEDIATE_ONLY_IDS.contains(&vendor_device))?;

        // Controller-level interrupts now; stream bits arm per transfer.
        regs.intctl.write(GIE | CIE);

        let mut graphs = Vec::new();
        for codec in 0..15u8 {
            if statests & (1 << codec) == 0 {
                continue;
            }
            match graph::enumerate_codec(&mut &cmd, codec) {
                Ok(graph) => graphs.push(graph),
                Err(err) => log::error!("codec {}: enumeration failed: {}", codec, err),
            }
        }

        let mut endpoints = Vec::new();
        let mut devices = Vec::new();
        for (graph_index, codec_graph) in graphs.iter_mut().enumerate() {
            for (group_index, group) in codec_graph.groups.iter_mut().enumerate() {
                if !group.is_audio() {
                    continue;
                }
                if let Err(err) = graph::power_up(&mut &cmd, codec_graph.codec, group) {
                    log::error!(
                        "codec {} group {:02X}: power-up failed: {}",
                        codec_graph.codec,
                        group.nid,
                        err
                    );
                    continue;
                }
                let paths = graph::discover_paths(group);
                log::debug!(
                    "codec {} group {:02X}: {} paths",
                    codec_graph.codec,
                    group.nid,
                    paths.len()
                );
                for endpoint in graph::converter_endpoints(group, &paths) {
                    let context = endpoints.len();
                    devices.push(Arc::new(publish_device(group, &endpoint, &paths, context)));
                    endpoints.push(EndpointInfo {
                        codec: codec_graph.codec,
                        graph: graph_index,
                        group: group_index,
                        nid: endpoint.nid,
                        direction: endpoint.direction,
                        paths: endpoint.paths.iter().map(|&p| paths[p].clone()).collect(),
                    });
                }
            }
        }
        if devices.is_empty() {
            log::warn!("no converter is reachable from any jack");
        }

        let state = ControllerState {
            pool: StreamPool::new(
                caps.input_streams,
                caps.output_streams,
                caps.bidirectional_streams,
            ),
            streams: (0..caps.total_streams()).map(|_| None).collect(),
            endpoints: endpoints
                .iter()
                .map(|_| EndpointRuntime {
                    state: DeviceState::Uninitialized,
                    config: None,
                    slot: None,
                    volume: Volume::flat(75),
                })
                .collect(),
        };

        Ok(Arc::new(Controller {
            base,
            caps,
            regs: spin::Mutex::new(regs),
            cmd,
            state: spin::Mutex::new(state),
            graphs,
            endpoints,
            devices,
            pending_complete: AtomicU32::new(0),
            pending_error: AtomicU32::new(0),
            interrupt_count: AtomicUsize::new(0),
        }))
    }

    pub fn caps(&self) -> ControllerCaps {
        self.caps
    }

    pub fn devices(&self) -> &[Arc<SoundDevice>] {
        &self.devices
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupt_count.load(Ordering::Relaxed)
    }

    pub fn unsolicited_count(&self) -> usize {
        self.cmd.unsolicited_count()
    }

    /// Registers this controller's endpoints with the sound core.
    pub fn sound_core(self: &Arc<Self>) -> Result<Arc<SoundCore>> {
        let registration = HostRegistration {
            min_fragment_size: MIN_FRAGMENT_SIZE,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            max_fragment_count: BDL_ENTRIES,
            max_buffer_size: MAX_BUFFER_SIZE,
            noncached_dma: false,
            devices: self.devices.clone(),
        };
        SoundCore::new(self.clone() as Arc<dyn HostInterface>, registration)
    }

    unsafe fn stream_regs(&self, slot: usize) -> &'static mut StreamDescriptorRegs {
        &mut *((self.base + stream_descriptor_offset(slot)) as *mut StreamDescriptorRegs)
    }

    /// Interrupt top half. Reads and acknowledges hardware status, files
    /// pending stream work, and reports whether this device interrupted.
    pub fn irq(&self) -> bool {
        let intsts = self.regs.lock().intsts.read();
        if intsts & GIS == 0 {
            return false;
        }
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);

        if intsts & CIS != 0 {
            self.cmd.reap();
            let mut regs = self.regs.lock();
            let rirbsts = regs.rirbsts.read();
            regs.rirbsts.write(rirbsts);
        }

        let stream_bits = intsts & STREAM_INT_MASK;
        if stream_bits != 0 {
            for slot in 0..self.caps.total_streams() {
                if stream_bits & (1 << slot) == 0 {
                    continue;
                }
                let descriptor = unsafe { self.stream_regs(slot) };
                let status = descriptor.status();
                if status == 0 {
                    continue;
                }
                descriptor.clear_status();
                if status & SD_BCIS != 0 {
                    self.pending_complete.fetch_or(1 << slot, Ordering::AcqRel);
                }
                if status & (SD_FIFOE | SD_DESE) != 0 {
                    self.pending_error.fetch_or(1 << slot, Ordering::AcqRel);
                }
            }
        }
        true
    }

    /// Deferred half: publishes new hardware positions and faults to the
    /// rings flagged by `irq`.
    pub fn dispatch(&self) {
        let complete = self.pending_complete.swap(0, Ordering::AcqRel);
        let errors = self.pending_error.swap(0, Ordering::AcqRel);
        if complete == 0 && errors == 0 {
            return;
        }

        let state = self.state.lock();
        for (slot, stream) in state.streams.iter().enumerate() {
            let Some(stream) = stream.as_ref() else {
                continue;
            };
            let bit = 1u32 << slot;
            if complete & bit != 0 {
                stream.ring().update_hardware(stream.position());
            }
            if errors & bit != 0 {
                log::error!("slot {}: descriptor or FIFO fault", slot);
                stream.ring().event().latch_error();
            }
        }
    }

    /// Rings the first beep generator found during enumeration.
    pub fn beep(&self, divisor: u8) -> Result<()> {
        for codec_graph in &self.graphs {
            if let Some(nid) = codec_graph.beep {
                self.cmd.get_set_verb(
                    (codec_graph.codec, nid),
                    verb::SET_BEEP,
                    divisor as u32,
                    true,
                )?;
                return Ok(());
            }
        }
        Err(Error::NotSupported)
    }

    fn endpoint_group(&self, info: &EndpointInfo) -> &FunctionGroup {
        &self.graphs[info.graph].groups[info.group]
    }

    fn endpoint_initialize(
        &self,
        index: usize,
        info: &EndpointInfo,
        config: StreamConfig,
    ) -> Result<InfoReply> {
        let path = info.paths.first().ok_or(Error::InvalidConfiguration)?;
        let group = self.endpoint_group(info);
        let format = format_word(config.rate, config.format, config.channels)?;

        // The converter binds to a live stream tag at start; program the
        // path with the reserved tag for now.
        graph::program_path(
            &mut &self.cmd,
            info.codec,
            group,
            path,
            0,
            format,
            config.channels,
        )?;
        graph::program_volume(&mut &self.cmd, info.codec, group, path, config.volume)?;

        let mut state = self.state.lock();
        let runtime = &mut state.endpoints[index];
        runtime.volume = config.volume;
        runtime.config = Some(config);
        runtime.state = DeviceState::Initialized;
        Ok(InfoReply::Done)
    }

    fn endpoint_start(&self, index: usize, info: &EndpointInfo) -> Result<InfoReply> {
        let config = {
            let mut state = self.state.lock();
            let runtime = &mut state.endpoints[index];
            match runtime.state {
                DeviceState::Running => return Ok(InfoReply::Done),
                DeviceState::Uninitialized => return Err(Error::InvalidConfiguration),
                DeviceState::Initialized => {}
            }
            runtime.config.clone().ok_or(Error::InvalidConfiguration)?
        };
        let format = format_word(config.rate, config.format, config.channels)?;

        let assignment = self.state.lock().pool.allocate(info.direction)?;

        let built = (|| {
            let mut runtime = unsafe {
                StreamRuntime::new(
                    self.base + stream_descriptor_offset(assignment.slot),
                    assignment,
                    config.ring.clone(),
                )
            }?;
            runtime.configure(format)?;

            let path = info.paths.first().ok_or(Error::InvalidConfiguration)?;
            let group = self.endpoint_group(info);
            graph::program_path(
                &mut &self.cmd,
                info.codec,
                group,
                path,
                assignment.number,
                format,
                config.channels,
            )?;
            Ok(runtime)
        })();

        let mut runtime = match built {
            Ok(runtime) => runtime,
            Err(err) => {
                self.state.lock().pool.free(assignment);
                return Err(err);
            }
        };

        // Interrupt mask, stream sync, and run bits move as one unit with
        // respect to other streams' starts and stops.
        {
            let mut regs = self.regs.lock();
            let bit = 1u32 << assignment.slot;
            let intctl = regs.intctl.read();
            regs.intctl.write(intctl | bit);
            let ssync = regs.ssync.read();
            regs.ssync.write(ssync | bit);
            runtime.start_dma();
            let ssync = regs.ssync.read();
            regs.ssync.write(ssync & !bit);
        }

        let mut state = self.state.lock();
        state.streams[assignment.slot] = Some(runtime);
        let endpoint = &mut state.endpoints[index];
        endpoint.slot = Some(assignment.slot);
        endpoint.state = DeviceState::Running;
        log::debug!(
            "endpoint {}: running on slot {} tag {}",
            index,
            assignment.slot,
            assignment.number
        );
        Ok(InfoReply::Done)
    }

    fn endpoint_stop(&self, index: usize, info: &EndpointInfo) -> Result<InfoReply> {
        let runtime = {
            let mut state = self.state.lock();
            let endpoint = &mut state.endpoints[index];
            endpoint.state = DeviceState::Uninitialized;
            endpoint.config = None;
            let slot = endpoint.slot.take();
            slot.and_then(|slot| state.streams[slot].take())
        };

        let Some(mut runtime) = runtime else {
            return Ok(InfoReply::Done);
        };
        let assignment = runtime.assignment();
        let bit = 1u32 << assignment.slot;

        {
            let mut regs = self.regs.lock();
            let ssync = regs.ssync.read();
            regs.ssync.write(ssync | bit);
        }
        // The run-bit handshake may take a while; keep it off the shared
        // register lock.
        runtime.stop_dma();
        {
            let mut regs = self.regs.lock();
            let intctl = regs.intctl.read();
            regs.intctl.write(intctl & !bit);
            let ssync = regs.ssync.read();
            regs.ssync.write(ssync & !bit);
        }

        self.state.lock().pool.free(assignment);

        if let Err(err) =
            self.cmd
                .get_set_verb((info.codec, info.nid), verb::SET_STREAM_CHANNEL, 0, true)
        {
            log::warn!("endpoint {}: converter unbind failed: {}", index, err);
        }
        Ok(InfoReply::Done)
    }

    fn endpoint_volume(
        &self,
        index: usize,
        info: &EndpointInfo,
        volume: Volume,
    ) -> Result<InfoReply> {
        let path = info.paths.first().ok_or(Error::InvalidConfiguration)?;
        let group = self.endpoint_group(info);
        graph::program_volume(&mut &self.cmd, info.codec, group, path, volume)?;
        self.state.lock().endpoints[index].volume = volume;
        Ok(InfoReply::Done)
    }
}

impl HostInterface for Controller {
    fn get_set_info(&self, device: &Arc<SoundDevice>, request: InfoRequest) -> Result<InfoReply> {
        let index = device.context();
        let info = self.endpoints.get(index).ok_or(Error::InvalidParameter)?;
        match request {
            InfoRequest::SetState(StateRequest::Initialized(config)) => {
                self.endpoint_initialize(index, info, config)
            }
            InfoRequest::SetState(StateRequest::Running) => self.endpoint_start(index, info),
            InfoRequest::SetState(StateRequest::Uninitialized) => self.endpoint_stop(index, info),
            InfoRequest::GetState => Ok(InfoReply::State(self.state.lock().endpoints[index].state)),
            InfoRequest::SetVolume(volume) => self.endpoint_volume(index, info, volume),
            InfoRequest::GetVolume => {
                Ok(InfoReply::Volume(self.state.lock().endpoints[index].volume))
            }
        }
    }

    fn alloc_dma_buffer(
        &self,
        _device: &Arc<SoundDevice>,
        fragment_size: usize,
        fragment_count: usize,
    ) -> Result<AudioBuffer> {
        if !fragment_size.is_power_of_two()
            || fragment_size < MIN_FRAGMENT_SIZE
            || fragment_count < 2
            || fragment_count > BDL_ENTRIES
        {
            return Err(Error::InvalidConfiguration);
        }
        AudioBuffer::allocate(fragment_size * fragment_count)
    }
}

/// Full link reset per the controller programming sequence; returns the
/// codec presence mask captured after codecs self-enumerate.
fn reset_controller(regs: &mut ControllerRegs, cmd: &CommandRing) -> Result<u16> {
    cmd.stop()?;

    let timeout = Timeout::from_secs(1);
    regs.gctl.writef(CRST, false);
    while regs.gctl.readf(CRST) {
        timeout.run().map_err(|()| {
            log::error!("controller refused to enter reset");
            Error::Timeout
        })?;
    }

    thread::sleep(Duration::from_micros(100));

    let timeout = Timeout::from_secs(1);
    regs.gctl.writef(CRST, true);
    while !regs.gctl.readf(CRST) {
        timeout.run().map_err(|()| {
            log::error!("controller refused to leave reset");
            Error::Timeout
        })?;
    }

    // Codecs need 521 us after reset deasserts to request enumeration.
    thread::sleep(Duration::from_micros(521));

    let statests = regs.statests.read();
    regs.statests.write(statests);
    log::debug!("codec presence mask {:04X}", statests);
    Ok(statests)
}

/// Derives the published device record for one reachable converter.
fn publish_device(
    group: &FunctionGroup,
    endpoint: &graph::ConverterEndpoint,
    paths: &[WidgetPath],
    context: usize,
) -> SoundDevice {
    let widget = group
        .widget(endpoint.nid)
        .expect("endpoint converter must exist in its group");

    let rates = supported_rates(widget.rates_sizes);
    let formats = supported_formats(widget.rates_sizes, widget.formats);
    let max_channels = widget.caps.channel_count();

    let mut capabilities = DeviceCapabilities::MMAP | DeviceCapabilities::CHANNEL_MONO;
    capabilities |= if widget.caps.digital() {
        DeviceCapabilities::INTERFACE_DIGITAL
    } else {
        DeviceCapabilities::INTERFACE_ANALOG
    };
    if max_channels >= 2 {
        capabilities |= DeviceCapabilities::CHANNEL_STEREO;
    }
    if max_channels > 2 {
        capabilities |= DeviceCapabilities::CHANNEL_MULTI;
    }

    let routes: Vec<Route> = endpoint
        .paths
        .iter()
        .enumerate()
        .map(|(route_index, &path_index)| {
            let path = &paths[path_index];
            let kind = group
                .widget(path.pin())
                .map(|pin| pin.config.default_device().route_type(endpoint.direction))
                .unwrap_or(soundcore::RouteType::Unknown);
            Route {
                kind,
                widgets: path
                    .nids
                    .iter()
                    .filter_map(|&nid| group.widget_index(nid))
                    .collect(),
                context: route_index,
            }
        })
        .collect();

    log::info!(
        "publishing {:?} converter {:02X}: {} routes, {} rates, formats {:?}",
        endpoint.direction,
        endpoint.nid,
        routes.len(),
        rates.len(),
        formats
    );

    SoundDevice::new(
        endpoint.direction,
        formats,
        1,
        max_channels,
        rates,
        capabilities,
        routes,
        context,
    )
}
