use soundcore::device::MAX_ROUTE_WIDGETS;
use soundcore::{DeviceType, Error, Result, Volume};

use crate::cmdbuff::{CodecAddr, VerbIo, WidgetAddr};
use crate::node::{
    param, verb, AmpCaps, PinCaps, PinConfig, Widget, WidgetCaps, WidgetType, EAPD_ENABLE,
    PIN_CTL_HEADPHONE, PIN_CTL_IN_ENABLE, PIN_CTL_OUT_ENABLE, POWER_STATES_EXTENDED,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionGroupKind {
    Audio,
    Modem,
    Other(u8),
}

impl FunctionGroupKind {
    fn from_bits(bits: u8) -> FunctionGroupKind {
        match bits & 0x7F {
            0x01 => FunctionGroupKind::Audio,
            0x02 => FunctionGroupKind::Modem,
            other => FunctionGroupKind::Other(other),
        }
    }
}

/// A codec's function group: a dense widget array indexed by
/// `nid - node_start`, plus the group-level defaults widgets inherit.
pub struct FunctionGroup {
    pub nid: u16,
    pub kind: FunctionGroupKind,
    pub node_start: u16,
    pub widgets: Vec<Widget>,
    pub default_rates_sizes: u32,
    pub default_formats: u32,
    pub default_in_amp: AmpCaps,
    pub default_out_amp: AmpCaps,
    pub extended_power_states: bool,
}

impl FunctionGroup {
    pub fn is_audio(&self) -> bool {
        self.kind == FunctionGroupKind::Audio
    }

    pub fn widget(&self, nid: u16) -> Option<&Widget> {
        let index = nid.checked_sub(self.node_start)?;
        self.widgets.get(index as usize)
    }

    fn widget_mut(&mut self, nid: u16) -> Option<&mut Widget> {
        let index = nid.checked_sub(self.node_start)?;
        self.widgets.get_mut(index as usize)
    }

    /// Dense index of a node, for route publication.
    pub fn widget_index(&self, nid: u16) -> Option<u32> {
        let index = nid.checked_sub(self.node_start)?;
        if (index as usize) < self.widgets.len() {
            Some(index as u32)
        } else {
            None
        }
    }
}

/// Everything read off one codec address.
pub struct CodecGraph {
    pub codec: CodecAddr,
    pub vendor_id: u32,
    pub revision_id: u32,
    pub groups: Vec<FunctionGroup>,
    /// First beep generator seen, if any.
    pub beep: Option<u16>,
}

fn subordinate_nodes(bus: &mut dyn VerbIo, addr: WidgetAddr) -> Result<(u16, u16)> {
    let word = bus.verb(addr, verb::GET_PARAMETER, param::SUBORDINATE_NODES)?;
    Ok((((word >> 16) & 0xFF) as u16, (word & 0xFF) as u16))
}

/// Walks the root node down through function groups to widgets on one
/// codec address.
pub fn enumerate_codec(bus: &mut dyn VerbIo, codec: CodecAddr) -> Result<CodecGraph> {
    let root = (codec, 0);
    let vendor_id = bus.verb(root, verb::GET_PARAMETER, param::VENDOR_ID)?;
    let revision_id = bus.verb(root, verb::GET_PARAMETER, param::REVISION_ID)?;
    log::info!(
        "codec {}: vendor {:04X}:{:04X} revision {:08X}",
        codec,
        vendor_id >> 16,
        vendor_id & 0xFFFF,
        revision_id
    );

    let (group_start, group_count) = subordinate_nodes(bus, root)?;
    let mut graph = CodecGraph {
        codec,
        vendor_id,
        revision_id,
        groups: Vec::new(),
        beep: None,
    };

    for group_nid in group_start..group_start + group_count {
        let group = read_group(bus, codec, group_nid, &mut graph.beep)?;
        log::debug!(
            "codec {} group {:02X}: {:?}, {} widgets from {:02X}",
            codec,
            group_nid,
            group.kind,
            group.widgets.len(),
            group.node_start
        );
        graph.groups.push(group);
    }
    Ok(graph)
}

fn read_group(
    bus: &mut dyn VerbIo,
    codec: CodecAddr,
    nid: u16,
    beep: &mut Option<u16>,
) -> Result<FunctionGroup> {
    let addr = (codec, nid);
    let kind = FunctionGroupKind::from_bits(
        (bus.verb(addr, verb::GET_PARAMETER, param::FUNCTION_GROUP_TYPE)? & 0xFF) as u8,
    );
    let default_rates_sizes = bus.verb(addr, verb::GET_PARAMETER, param::PCM_RATES_SIZES)?;
    let default_formats = bus.verb(addr, verb::GET_PARAMETER, param::STREAM_FORMATS)?;
    let default_in_amp = AmpCaps(bus.verb(addr, verb::GET_PARAMETER, param::IN_AMP_CAPS)?);
    let default_out_amp = AmpCaps(bus.verb(addr, verb::GET_PARAMETER, param::OUT_AMP_CAPS)?);
    let power_states = bus.verb(addr, verb::GET_PARAMETER, param::SUPPORTED_POWER_STATES)?;

    let (node_start, node_count) = subordinate_nodes(bus, addr)?;
    let mut group = FunctionGroup {
        nid,
        kind,
        node_start,
        widgets: Vec::with_capacity(node_count as usize),
        default_rates_sizes,
        default_formats,
        default_in_amp,
        default_out_amp,
        extended_power_states: power_states & POWER_STATES_EXTENDED != 0,
    };

    for widget_nid in node_start..node_start + node_count {
        let widget = read_widget(bus, codec, widget_nid, &group)?;
        if widget.widget_type() == WidgetType::BeepGenerator && beep.is_none() {
            *beep = Some(widget_nid);
        }
        log::trace!("codec {}: {}", codec, widget);
        group.widgets.push(widget);
    }
    Ok(group)
}

fn read_widget(
    bus: &mut dyn VerbIo,
    codec: CodecAddr,
    nid: u16,
    group: &FunctionGroup,
) -> Result<Widget> {
    let addr = (codec, nid);
    let caps = WidgetCaps(bus.verb(addr, verb::GET_PARAMETER, param::WIDGET_CAPS)?);

    // Widgets without their own amplifier parameters use the group's.
    let (in_amp, out_amp) = if caps.amp_override() {
        (
            AmpCaps(bus.verb(addr, verb::GET_PARAMETER, param::IN_AMP_CAPS)?),
            AmpCaps(bus.verb(addr, verb::GET_PARAMETER, param::OUT_AMP_CAPS)?),
        )
    } else {
        (group.default_in_amp, group.default_out_amp)
    };

    let (pin_caps, config) = if caps.widget_type() == WidgetType::PinComplex {
        (
            PinCaps(bus.verb(addr, verb::GET_PARAMETER, param::PIN_CAPS)?),
            PinConfig(bus.verb(addr, verb::GET_CONFIG_DEFAULT, 0)?),
        )
    } else {
        (PinCaps::default(), PinConfig::default())
    };

    // Converters with blank rate/format registers inherit the group's.
    let (mut rates_sizes, mut formats) = (0, 0);
    if caps.widget_type() == WidgetType::AudioOutput
        || caps.widget_type() == WidgetType::AudioInput
    {
        rates_sizes = bus.verb(addr, verb::GET_PARAMETER, param::PCM_RATES_SIZES)?;
        formats = bus.verb(addr, verb::GET_PARAMETER, param::STREAM_FORMATS)?;
        if rates_sizes == 0 {
            rates_sizes = group.default_rates_sizes;
        }
        if formats == 0 {
            formats = group.default_formats;
        }
    }

    let connections = if caps.has_connection_list() {
        read_connection_list(bus, addr)?
    } else {
        Vec::new()
    };

    Ok(Widget {
        nid,
        caps,
        in_amp,
        out_amp,
        pin_caps,
        config,
        rates_sizes,
        formats,
        connections,
        accessible: false,
    })
}

/// Fetches and expands a widget's connection list.
///
/// Entries come four per fetch in short form (8-bit) or two per fetch in
/// long form (16-bit). A range entry stands for every node id from the end
/// of the previous entry up to and including its own.
pub fn read_connection_list(bus: &mut dyn VerbIo, addr: WidgetAddr) -> Result<Vec<u16>> {
    let length_field = bus.verb(addr, verb::GET_PARAMETER, param::CONNECTION_LIST_LENGTH)?;
    let count = (length_field & 0x7F) as usize;
    let long_form = length_field & 0x80 != 0;
    let per_fetch = if long_form { 2 } else { 4 };

    let mut list = Vec::new();
    let mut range_start: u16 = 0;
    let mut consumed = 0;
    while consumed < count {
        let word = bus.verb(addr, verb::GET_CONNECTION_ENTRY, consumed as u32)?;
        for slot in 0..per_fetch {
            if consumed >= count {
                break;
            }
            let (id, is_range) = if long_form {
                let field = (word >> (16 * slot)) & 0xFFFF;
                ((field & 0x7FFF) as u16, field & 0x8000 != 0)
            } else {
                let field = (word >> (8 * slot)) & 0xFF;
                ((field & 0x7F) as u16, field & 0x80 != 0)
            };
            consumed += 1;
            if id == 0 {
                continue;
            }
            if is_range {
                for implicit in range_start..id {
                    list.push(implicit);
                }
            }
            list.push(id);
            range_start = id + 1;
        }
    }
    Ok(list)
}

/// Resets and powers a function group: group reset (twice when extended
/// power states exist), everything to D0, external amplifiers on.
pub fn power_up(bus: &mut dyn VerbIo, codec: CodecAddr, group: &FunctionGroup) -> Result<()> {
    let group_addr = (codec, group.nid);
    bus.verb(group_addr, verb::FUNCTION_RESET, 0)?;
    if group.extended_power_states {
        bus.verb(group_addr, verb::FUNCTION_RESET, 0)?;
    }
    bus.verb(group_addr, verb::SET_POWER_STATE, 0)?;

    for widget in &group.widgets {
        if widget.caps.power_control() {
            bus.verb((codec, widget.nid), verb::SET_POWER_STATE, 0)?;
        }
        if widget.widget_type() == WidgetType::PinComplex && widget.pin_caps.eapd() {
            bus.verb((codec, widget.nid), verb::SET_EAPD, EAPD_ENABLE)?;
        }
    }
    bus.barrier(codec)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    /// Recordable: an audio input fed from an input jack.
    AdcFromInput,
    /// Playable: an audio output driving an output jack.
    DacToOutput,
    /// Monitor loop from an input jack straight to an output jack.
    InputToOutput,
}

/// An ordered node chain. The converter (or source jack for monitor loops)
/// is first, the terminal jack last.
#[derive(Clone, Debug)]
pub struct WidgetPath {
    pub kind: PathKind,
    pub nids: Vec<u16>,
}

impl WidgetPath {
    pub fn converter(&self) -> u16 {
        self.nids[0]
    }

    pub fn pin(&self) -> u16 {
        *self.nids.last().expect("path cannot be empty")
    }

    /// Selection key of the terminal jack; lower wins.
    pub fn priority(&self, group: &FunctionGroup) -> u8 {
        group
            .widget(self.pin())
            .map(|w| w.config.priority())
            .unwrap_or(u8::MAX)
    }
}

/// Depth-first path discovery over one group, run in two passes: audio
/// inputs looking for input jacks, then output jacks looking for audio
/// outputs (or input jacks, which become monitor loops). Chains longer
/// than [`MAX_ROUTE_WIDGETS`] are pruned silently. Converters reached by
/// at least one path are marked accessible.
pub fn discover_paths(group: &mut FunctionGroup) -> Vec<WidgetPath> {
    let mut paths = Vec::new();

    let adc_nids: Vec<u16> = group
        .widgets
        .iter()
        .filter(|w| w.widget_type() == WidgetType::AudioInput)
        .map(|w| w.nid)
        .collect();
    for nid in adc_nids {
        let mut stack = vec![nid];
        walk_toward_input(group, &mut stack, &mut paths);
    }

    let pin_nids: Vec<u16> = group
        .widgets
        .iter()
        .filter(|w| w.is_output_pin())
        .map(|w| w.nid)
        .collect();
    for nid in pin_nids {
        let mut stack = vec![nid];
        walk_toward_converter(group, &mut stack, &mut paths);
    }

    for path in &paths {
        if path.kind != PathKind::InputToOutput {
            if let Some(widget) = group.widget_mut(path.converter()) {
                widget.accessible = true;
            }
        }
    }
    paths
}

fn walk_toward_input(group: &FunctionGroup, stack: &mut Vec<u16>, paths: &mut Vec<WidgetPath>) {
    let current = *stack.last().expect("walk stack cannot be empty");
    let Some(widget) = group.widget(current) else {
        return;
    };
    let connections = widget.connections.clone();
    for next_nid in connections {
        if stack.contains(&next_nid) {
            continue;
        }
        let Some(next) = group.widget(next_nid) else {
            continue;
        };
        if next.is_input_pin() {
            if stack.len() + 1 <= MAX_ROUTE_WIDGETS {
                let mut nids = stack.clone();
                nids.push(next_nid);
                paths.push(WidgetPath {
                    kind: PathKind::AdcFromInput,
                    nids,
                });
            }
        } else if next.routable() && stack.len() + 1 < MAX_ROUTE_WIDGETS {
            stack.push(next_nid);
            walk_toward_input(group, stack, paths);
            stack.pop();
        }
    }
}

fn walk_toward_converter(group: &FunctionGroup, stack: &mut Vec<u16>, paths: &mut Vec<WidgetPath>) {
    let current = *stack.last().expect("walk stack cannot be empty");
    let Some(widget) = group.widget(current) else {
        return;
    };
    let connections = widget.connections.clone();
    for next_nid in connections {
        if stack.contains(&next_nid) {
            continue;
        }
        let Some(next) = group.widget(next_nid) else {
            continue;
        };
        if next.widget_type() == WidgetType::AudioOutput {
            if stack.len() + 1 <= MAX_ROUTE_WIDGETS {
                let mut nids = stack.clone();
                nids.push(next_nid);
                nids.reverse();
                paths.push(WidgetPath {
                    kind: PathKind::DacToOutput,
                    nids,
                });
            }
        } else if next.is_input_pin() {
            if stack.len() + 1 <= MAX_ROUTE_WIDGETS {
                let mut nids = stack.clone();
                nids.push(next_nid);
                nids.reverse();
                paths.push(WidgetPath {
                    kind: PathKind::InputToOutput,
                    nids,
                });
            }
        } else if next.routable() && stack.len() + 1 < MAX_ROUTE_WIDGETS {
            stack.push(next_nid);
            walk_toward_converter(group, stack, paths);
            stack.pop();
        }
    }
}

/// One publishable converter and its paths, primary first.
pub struct ConverterEndpoint {
    pub nid: u16,
    pub direction: DeviceType,
    /// Indices into the group's discovered path list.
    pub paths: Vec<usize>,
}

/// Groups paths by their converter and orders each converter's list so the
/// jack with the lowest selection key comes first.
pub fn converter_endpoints(group: &FunctionGroup, paths: &[WidgetPath]) -> Vec<ConverterEndpoint> {
    let mut endpoints: Vec<ConverterEndpoint> = Vec::new();
    for (index, path) in paths.iter().enumerate() {
        let direction = match path.kind {
            PathKind::AdcFromInput => DeviceType::Input,
            PathKind::DacToOutput => DeviceType::Output,
            PathKind::InputToOutput => continue,
        };
        let nid = path.converter();
        match endpoints.iter_mut().find(|e| e.nid == nid) {
            Some(endpoint) => endpoint.paths.push(index),
            None => endpoints.push(ConverterEndpoint {
                nid,
                direction,
                paths: vec![index],
            }),
        }
    }

    for endpoint in &mut endpoints {
        let best = endpoint
            .paths
            .iter()
            .enumerate()
            .min_by_key(|&(_, &path)| paths[path].priority(group))
            .map(|(position, _)| position)
            .unwrap_or(0);
        let primary = endpoint.paths.remove(best);
        endpoint.paths.insert(0, primary);
    }
    endpoints
}

/// Re-programs a path for a transfer: jack enables, selector indices, the
/// converter's format and stream binding. Flushed with a barrier.
pub fn program_path(
    bus: &mut dyn VerbIo,
    codec: CodecAddr,
    group: &FunctionGroup,
    path: &WidgetPath,
    stream_number: u8,
    format: u16,
    channels: u32,
) -> Result<()> {
    for (position, &nid) in path.nids.iter().enumerate() {
        let widget = group.widget(nid).ok_or(Error::InvalidConfiguration)?;
        let addr = (codec, nid);
        match widget.widget_type() {
            WidgetType::PinComplex => {
                let output_role = match path.kind {
                    PathKind::AdcFromInput => false,
                    PathKind::DacToOutput => true,
                    PathKind::InputToOutput => position != 0,
                };
                let mut control = if output_role {
                    PIN_CTL_OUT_ENABLE
                } else {
                    PIN_CTL_IN_ENABLE
                };
                if output_role
                    && widget.config.default_device() == crate::node::DefaultDevice::HeadphoneOut
                    && widget.pin_caps.headphone_drive()
                {
                    control |= PIN_CTL_HEADPHONE;
                }
                bus.verb(addr, verb::SET_PIN_CONTROL, control)?;
            }
            WidgetType::AudioMixer | WidgetType::AudioSelector => {
                if widget.connections.len() > 1 {
                    let source = match path.kind {
                        PathKind::AdcFromInput => path.nids.get(position + 1),
                        PathKind::DacToOutput | PathKind::InputToOutput => {
                            position.checked_sub(1).and_then(|p| path.nids.get(p))
                        }
                    };
                    if let Some(&source) = source {
                        if let Some(index) =
                            widget.connections.iter().position(|&c| c == source)
                        {
                            bus.verb(addr, verb::SET_CONNECTION_SELECT, index as u32)?;
                        }
                    }
                }
            }
            WidgetType::AudioOutput | WidgetType::AudioInput => {
                bus.verb(addr, verb::SET_CONVERTER_FORMAT, format as u32)?;
                bus.verb(
                    addr,
                    verb::SET_STREAM_CHANNEL,
                    ((stream_number as u32) & 0xF) << 4,
                )?;
                if channels > 2 {
                    bus.verb(addr, verb::SET_CHANNEL_COUNT, channels - 1)?;
                }
            }
            _ => {}
        }
    }
    bus.barrier(codec)
}

/// Amplifier gain/mute payload (short-form verb 0x3).
pub fn amp_gain_payload(
    output: bool,
    input: bool,
    left: bool,
    right: bool,
    index: u8,
    mute: bool,
    gain: u32,
) -> u32 {
    let mut payload = 0;
    if output {
        payload |= 1 << 15;
    }
    if input {
        payload |= 1 << 14;
    }
    if left {
        payload |= 1 << 13;
    }
    if right {
        payload |= 1 << 12;
    }
    payload |= ((index as u32) & 0xF) << 8;
    if mute {
        payload |= 1 << 7;
    }
    payload | (gain & 0x7F)
}

/// Maps a 0..=100 level onto an amplifier's step range.
///
/// Zero mutes when the amp can; otherwise the level scales into the step
/// count and rides the amp's offset, clamped at the bottom of the range.
pub fn amp_level(caps: AmpCaps, percent: u8) -> (bool, u32) {
    if percent == 0 {
        return (caps.can_mute(), 0);
    }
    let steps = caps.step_count();
    if steps == 0 {
        return (false, caps.offset());
    }
    let scaled = (percent.min(100) as u32) * steps / 100;
    let gain = caps.offset() as i64 - (steps as i64 - scaled as i64);
    (false, gain.clamp(0, 0x7F) as u32)
}

/// Programs every amplifier along a path from a packed left/right level.
/// Channels program together when equal, separately otherwise.
pub fn program_volume(
    bus: &mut dyn VerbIo,
    codec: CodecAddr,
    group: &FunctionGroup,
    path: &WidgetPath,
    volume: Volume,
) -> Result<()> {
    for &nid in &path.nids {
        let widget = group.widget(nid).ok_or(Error::InvalidConfiguration)?;
        if widget.caps.has_input_amp() {
            send_amp(bus, (codec, nid), widget.in_amp, false, volume)?;
        }
        if widget.caps.has_output_amp() {
            send_amp(bus, (codec, nid), widget.out_amp, true, volume)?;
        }
    }
    bus.barrier(codec)
}

fn send_amp(
    bus: &mut dyn VerbIo,
    addr: WidgetAddr,
    caps: AmpCaps,
    output: bool,
    volume: Volume,
) -> Result<()> {
    let input = !output;
    if volume.left == volume.right {
        let (mute, gain) = amp_level(caps, volume.left);
        let payload = amp_gain_payload(output, input, true, true, 0, mute, gain);
        bus.verb(addr, verb::SET_AMP_GAIN_MUTE, payload)?;
    } else {
        let (mute, gain) = amp_level(caps, volume.left);
        bus.verb(
            addr,
            verb::SET_AMP_GAIN_MUTE,
            amp_gain_payload(output, input, true, false, 0, mute, gain),
        )?;
        let (mute, gain) = amp_level(caps, volume.right);
        bus.verb(
            addr,
            verb::SET_AMP_GAIN_MUTE,
            amp_gain_payload(output, input, false, true, 0, mute, gain),
        )?;
    }
    Ok(())
}
