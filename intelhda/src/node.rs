use std::fmt;

use soundcore::{DeviceType, FormatMask, RouteType};

/// Codec parameter ids, fetched with [`verb::GET_PARAMETER`].
pub mod param {
    pub const VENDOR_ID: u32 = 0x00;
    pub const REVISION_ID: u32 = 0x02;
    pub const SUBORDINATE_NODES: u32 = 0x04;
    pub const FUNCTION_GROUP_TYPE: u32 = 0x05;
    pub const WIDGET_CAPS: u32 = 0x09;
    pub const PCM_RATES_SIZES: u32 = 0x0A;
    pub const STREAM_FORMATS: u32 = 0x0B;
    pub const PIN_CAPS: u32 = 0x0C;
    pub const IN_AMP_CAPS: u32 = 0x0D;
    pub const CONNECTION_LIST_LENGTH: u32 = 0x0E;
    pub const SUPPORTED_POWER_STATES: u32 = 0x0F;
    pub const OUT_AMP_CAPS: u32 = 0x12;
}

/// Verb ids used by enumeration and path programming.
pub mod verb {
    pub const SET_CONVERTER_FORMAT: u32 = 0x2;
    pub const SET_AMP_GAIN_MUTE: u32 = 0x3;
    pub const SET_CONNECTION_SELECT: u32 = 0x701;
    pub const SET_POWER_STATE: u32 = 0x705;
    pub const SET_STREAM_CHANNEL: u32 = 0x706;
    pub const SET_PIN_CONTROL: u32 = 0x707;
    pub const SET_BEEP: u32 = 0x70A;
    pub const SET_EAPD: u32 = 0x70C;
    pub const SET_CHANNEL_COUNT: u32 = 0x72D;
    pub const FUNCTION_RESET: u32 = 0x7FF;
    pub const GET_PARAMETER: u32 = 0xF00;
    pub const GET_CONNECTION_SELECT: u32 = 0xF01;
    pub const GET_CONNECTION_ENTRY: u32 = 0xF02;
    pub const GET_CONFIG_DEFAULT: u32 = 0xF1C;
}

// Pin widget control payload bits.
pub const PIN_CTL_IN_ENABLE: u32 = 1 << 5;
pub const PIN_CTL_OUT_ENABLE: u32 = 1 << 6;
pub const PIN_CTL_HEADPHONE: u32 = 1 << 7;

// EAPD payload.
pub const EAPD_ENABLE: u32 = 1 << 1;

// Supported-power-states bit advertising extended states.
pub const POWER_STATES_EXTENDED: u32 = 1 << 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WidgetType {
    AudioOutput,
    AudioInput,
    AudioMixer,
    AudioSelector,
    PinComplex,
    Power,
    VolumeKnob,
    BeepGenerator,
    VendorDefined,
    Reserved(u8),
}

impl WidgetType {
    fn from_bits(bits: u8) -> WidgetType {
        match bits {
            0x0 => WidgetType::AudioOutput,
            0x1 => WidgetType::AudioInput,
            0x2 => WidgetType::AudioMixer,
            0x3 => WidgetType::AudioSelector,
            0x4 => WidgetType::PinComplex,
            0x5 => WidgetType::Power,
            0x6 => WidgetType::VolumeKnob,
            0x7 => WidgetType::BeepGenerator,
            0xF => WidgetType::VendorDefined,
            other => WidgetType::Reserved(other),
        }
    }
}

/// Audio widget capability word (parameter 0x09).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WidgetCaps(pub u32);

impl WidgetCaps {
    pub fn widget_type(self) -> WidgetType {
        WidgetType::from_bits(((self.0 >> 20) & 0xF) as u8)
    }

    pub fn channel_count(self) -> u32 {
        let pairs = (self.0 >> 13) & 0x7;
        (pairs << 1 | (self.0 & 1)) + 1
    }

    pub fn stereo(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn has_input_amp(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn has_output_amp(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// The widget carries its own amplifier parameters instead of the
    /// group defaults.
    pub fn amp_override(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn has_connection_list(self) -> bool {
        self.0 & (1 << 8) != 0
    }

    pub fn digital(self) -> bool {
        self.0 & (1 << 9) != 0
    }

    pub fn power_control(self) -> bool {
        self.0 & (1 << 10) != 0
    }
}

/// Amplifier capability word (parameters 0x0D / 0x12).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AmpCaps(pub u32);

impl AmpCaps {
    pub fn offset(self) -> u32 {
        self.0 & 0x7F
    }

    pub fn step_count(self) -> u32 {
        (self.0 >> 8) & 0x7F
    }

    pub fn step_size(self) -> u32 {
        (self.0 >> 16) & 0x7F
    }

    pub fn can_mute(self) -> bool {
        self.0 & (1 << 31) != 0
    }
}

/// Pin capability word (parameter 0x0C).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinCaps(pub u32);

impl PinCaps {
    pub fn presence_detect(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    pub fn headphone_drive(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn output_capable(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    pub fn input_capable(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    pub fn eapd(self) -> bool {
        self.0 & (1 << 16) != 0
    }
}

/// What a pin's default configuration says it connects to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultDevice {
    LineOut,
    Speaker,
    HeadphoneOut,
    Cd,
    SpdifOut,
    DigitalOtherOut,
    ModemLineSide,
    ModemHandsetSide,
    LineIn,
    Aux,
    MicIn,
    Telephony,
    SpdifIn,
    DigitalOtherIn,
    Reserved,
    Other,
}

impl DefaultDevice {
    fn from_bits(bits: u8) -> DefaultDevice {
        match bits & 0xF {
            0x0 => DefaultDevice::LineOut,
            0x1 => DefaultDevice::Speaker,
            0x2 => DefaultDevice::HeadphoneOut,
            0x3 => DefaultDevice::Cd,
            0x4 => DefaultDevice::SpdifOut,
            0x5 => DefaultDevice::DigitalOtherOut,
            0x6 => DefaultDevice::ModemLineSide,
            0x7 => DefaultDevice::ModemHandsetSide,
            0x8 => DefaultDevice::LineIn,
            0x9 => DefaultDevice::Aux,
            0xA => DefaultDevice::MicIn,
            0xB => DefaultDevice::Telephony,
            0xC => DefaultDevice::SpdifIn,
            0xD => DefaultDevice::DigitalOtherIn,
            0xE => DefaultDevice::Reserved,
            _ => DefaultDevice::Other,
        }
    }

    /// Jacks a recordable path may terminate in.
    pub fn is_input_source(self) -> bool {
        matches!(
            self,
            DefaultDevice::LineIn
                | DefaultDevice::Aux
                | DefaultDevice::MicIn
                | DefaultDevice::SpdifIn
                | DefaultDevice::DigitalOtherIn
                | DefaultDevice::Other
        )
    }

    /// Jacks a playable path may terminate in.
    pub fn is_output_sink(self) -> bool {
        matches!(
            self,
            DefaultDevice::LineOut
                | DefaultDevice::Speaker
                | DefaultDevice::HeadphoneOut
                | DefaultDevice::Cd
                | DefaultDevice::SpdifOut
                | DefaultDevice::DigitalOtherOut
                | DefaultDevice::Aux
                | DefaultDevice::Other
        )
    }

    /// The published route type for a terminal jack of this kind.
    pub fn route_type(self, direction: DeviceType) -> RouteType {
        match (self, direction) {
            (DefaultDevice::LineOut, _) => RouteType::LineOut,
            (DefaultDevice::Speaker, _) => RouteType::Speaker,
            (DefaultDevice::HeadphoneOut, _) => RouteType::Headphone,
            (DefaultDevice::Cd, _) => RouteType::Cd,
            (DefaultDevice::SpdifOut, _) => RouteType::SpdifOut,
            (DefaultDevice::DigitalOtherOut, _) => RouteType::DigitalOut,
            (DefaultDevice::LineIn, _) => RouteType::LineIn,
            (DefaultDevice::Aux, _) => RouteType::Aux,
            (DefaultDevice::MicIn, _) => RouteType::Microphone,
            (DefaultDevice::SpdifIn, _) => RouteType::SpdifIn,
            (DefaultDevice::DigitalOtherIn, _) => RouteType::DigitalIn,
            _ => RouteType::Unknown,
        }
    }
}

/// Pin configuration default (verb 0xF1C).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinConfig(pub u32);

impl PinConfig {
    pub fn sequence(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub fn association(self) -> u8 {
        ((self.0 >> 4) & 0xF) as u8
    }

    pub fn default_device(self) -> DefaultDevice {
        DefaultDevice::from_bits(((self.0 >> 20) & 0xF) as u8)
    }

    /// Port connectivity 0b01 means nothing is physically attached.
    pub fn connected(self) -> bool {
        (self.0 >> 30) & 0x3 != 0x1
    }

    /// Lower sorts earlier; drives primary-route selection.
    pub fn priority(self) -> u8 {
        (self.association() << 4) | self.sequence()
    }
}

/// Sample rate bits of parameter 0x0A, ascending.
const RATE_TABLE: [(u32, u32); 12] = [
    (1 << 0, 8000),
    (1 << 1, 11025),
    (1 << 2, 16000),
    (1 << 3, 22050),
    (1 << 4, 32000),
    (1 << 5, 44100),
    (1 << 6, 48000),
    (1 << 7, 88200),
    (1 << 8, 96000),
    (1 << 9, 176400),
    (1 << 10, 192000),
    (1 << 11, 384000),
];

/// Decodes supported rates from a rates/sizes word.
pub fn supported_rates(rates_sizes: u32) -> Vec<u32> {
    RATE_TABLE
        .iter()
        .filter(|(bit, _)| rates_sizes & bit != 0)
        .map(|&(_, hz)| hz)
        .collect()
}

/// Maps a rates/sizes word plus a stream-formats word to wire formats.
pub fn supported_formats(rates_sizes: u32, stream_formats: u32) -> FormatMask {
    let mut formats = FormatMask::empty();
    if stream_formats & 0x1 != 0 {
        if rates_sizes & (1 << 16) != 0 {
            formats |= FormatMask::PCM8;
        }
        if rates_sizes & (1 << 17) != 0 {
            formats |= FormatMask::PCM16;
        }
        if rates_sizes & (1 << 18) != 0 {
            formats |= FormatMask::PCM20;
        }
        if rates_sizes & (1 << 19) != 0 {
            formats |= FormatMask::PCM24;
        }
        if rates_sizes & (1 << 20) != 0 {
            formats |= FormatMask::PCM32;
        }
    }
    if stream_formats & 0x2 != 0 {
        formats |= FormatMask::FLOAT32;
    }
    if stream_formats & 0x4 != 0 {
        formats |= FormatMask::AC3;
    }
    formats
}

/// One node of a codec's graph, with every capability word resolved
/// (group defaults already applied where the widget does not override).
#[derive(Clone, Debug)]
pub struct Widget {
    pub nid: u16,
    pub caps: WidgetCaps,
    pub in_amp: AmpCaps,
    pub out_amp: AmpCaps,
    pub pin_caps: PinCaps,
    pub config: PinConfig,
    pub rates_sizes: u32,
    pub formats: u32,
    pub connections: Vec<u16>,
    pub accessible: bool,
}

impl Widget {
    pub fn widget_type(&self) -> WidgetType {
        self.caps.widget_type()
    }

    pub fn is_converter(&self) -> bool {
        matches!(
            self.widget_type(),
            WidgetType::AudioOutput | WidgetType::AudioInput
        )
    }

    /// A pin wired to a jack a recordable path can start from.
    pub fn is_input_pin(&self) -> bool {
        self.widget_type() == WidgetType::PinComplex
            && self.pin_caps.input_capable()
            && self.config.connected()
            && self.config.default_device().is_input_source()
    }

    /// A pin wired to a jack a playable path can end in.
    pub fn is_output_pin(&self) -> bool {
        self.widget_type() == WidgetType::PinComplex
            && self.config.connected()
            && self.config.default_device().is_output_sink()
    }

    /// May sit in the middle of a path.
    pub fn routable(&self) -> bool {
        matches!(
            self.widget_type(),
            WidgetType::AudioMixer | WidgetType::AudioSelector | WidgetType::PinComplex
        )
    }
}

impl fmt::Display for Widget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.widget_type() {
            WidgetType::PinComplex => write!(
                f,
                "node {:02X}: {:?} ({:?}, priority {:02X}), inputs {:X?}",
                self.nid,
                self.widget_type(),
                self.config.default_device(),
                self.config.priority(),
                self.connections
            ),
            _ => write!(
                f,
                "node {:02X}: {:?}, inputs {:X?}",
                self.nid,
                self.widget_type(),
                self.connections
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_caps_fields() {
        // Stereo DAC with an output amp and its own amp parameters.
        let caps = WidgetCaps((0x0 << 20) | (1 << 2) | (1 << 3) | 1);
        assert_eq!(caps.widget_type(), WidgetType::AudioOutput);
        assert_eq!(caps.channel_count(), 2);
        assert!(caps.has_output_amp());
        assert!(caps.amp_override());
        assert!(!caps.digital());

        // 8-channel digital pin.
        let caps = WidgetCaps((0x4 << 20) | (0x3 << 13) | (1 << 9) | 1);
        assert_eq!(caps.widget_type(), WidgetType::PinComplex);
        assert_eq!(caps.channel_count(), 8);
        assert!(caps.digital());
    }

    #[test]
    fn amp_caps_fields() {
        let caps = AmpCaps((1 << 31) | (0x2 << 16) | (0x3F << 8) | 0x1F);
        assert!(caps.can_mute());
        assert_eq!(caps.step_size(), 2);
        assert_eq!(caps.step_count(), 0x3F);
        assert_eq!(caps.offset(), 0x1F);
    }

    #[test]
    fn pin_config_priority_key() {
        // Speaker jack, association 1, sequence 0.
        let config = PinConfig((0x1 << 20) | (0x1 << 4));
        assert_eq!(config.default_device(), DefaultDevice::Speaker);
        assert_eq!(config.priority(), 0x10);
        assert!(config.connected());

        // Port with nothing attached.
        let config = PinConfig(0x4000_0000);
        assert!(!config.connected());

        let config = PinConfig((0x2 << 4) | 0x5);
        assert_eq!(config.priority(), 0x25);
    }

    #[test]
    fn rate_and_format_decoding() {
        let rates_sizes = (1 << 17) | (1 << 20) | (1 << 6) | (1 << 5) | (1 << 0);
        assert_eq!(supported_rates(rates_sizes), vec![8000, 44100, 48000]);

        let formats = supported_formats(rates_sizes, 0x1);
        assert_eq!(formats, FormatMask::PCM16 | FormatMask::PCM32);

        let formats = supported_formats(rates_sizes, 0x7);
        assert!(formats.contains(FormatMask::FLOAT32));
        assert!(formats.contains(FormatMask::AC3));

        // No stream format bits, no wire formats.
        assert_eq!(supported_formats(rates_sizes, 0x6) & (FormatMask::PCM16 | FormatMask::PCM32), FormatMask::empty());
    }

    #[test]
    fn jack_classification() {
        assert!(DefaultDevice::MicIn.is_input_source());
        assert!(!DefaultDevice::MicIn.is_output_sink());
        assert!(DefaultDevice::Speaker.is_output_sink());
        // Auxiliary jacks route either way.
        assert!(DefaultDevice::Aux.is_input_source());
        assert!(DefaultDevice::Aux.is_output_sink());

        assert_eq!(
            DefaultDevice::HeadphoneOut.route_type(DeviceType::Output),
            RouteType::Headphone
        );
        assert_eq!(
            DefaultDevice::ModemLineSide.route_type(DeviceType::Output),
            RouteType::Unknown
        );
    }
}
