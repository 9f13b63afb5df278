use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Atomic per-device flag word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Exactly one open handle exists while set.
        const BUSY = 1 << 0;
        /// Capture may start as soon as a handle asks for data.
        const ENABLE_INPUT = 1 << 1;
        /// Playback may start as soon as data is queued.
        const ENABLE_OUTPUT = 1 << 2;
    }
}

bitflags! {
    /// Static capabilities a controller declares for a device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceCapabilities: u32 {
        /// The cyclic buffer may be handed out as a live window.
        const MMAP = 1 << 0;
        /// The device is not armed automatically at open.
        const MANUAL_ENABLE = 1 << 1;
        const INTERFACE_ANALOG = 1 << 2;
        const INTERFACE_DIGITAL = 1 << 3;
        const CHANNEL_MONO = 1 << 4;
        const CHANNEL_STEREO = 1 << 5;
        const CHANNEL_MULTI = 1 << 6;
    }
}

bitflags! {
    /// Wire sample formats.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FormatMask: u32 {
        const PCM8 = 1 << 0;
        const PCM16 = 1 << 1;
        const PCM20 = 1 << 2;
        const PCM24 = 1 << 3;
        const PCM32 = 1 << 4;
        const FLOAT32 = 1 << 5;
        const AC3 = 1 << 6;
    }
}

impl FormatMask {
    /// The lowest set format bit, or empty.
    pub fn lowest(self) -> FormatMask {
        if self.is_empty() {
            FormatMask::empty()
        } else {
            FormatMask::from_bits_retain(1 << self.bits().trailing_zeros())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Input,
    Output,
}

impl DeviceType {
    pub fn enable_flag(self) -> DeviceFlags {
        match self {
            DeviceType::Input => DeviceFlags::ENABLE_INPUT,
            DeviceType::Output => DeviceFlags::ENABLE_OUTPUT,
        }
    }
}

/// What a route terminates in, derived from its far-end jack or transceiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteType {
    LineOut,
    Speaker,
    Headphone,
    Cd,
    SpdifOut,
    DigitalOut,
    LineIn,
    Aux,
    Microphone,
    SpdifIn,
    DigitalIn,
    Unknown,
}

/// Longest widget chain a route may take through a codec.
pub const MAX_ROUTE_WIDGETS: usize = 10;

/// A typed widget chain from a converter to a jack. `widgets` holds dense
/// per-group widget indices; `context` is the controller's descriptor for
/// the underlying path.
#[derive(Clone, Debug)]
pub struct Route {
    pub kind: RouteType,
    pub widgets: Vec<u32>,
    pub context: usize,
}

/// One playable or recordable endpoint published by a controller.
pub struct SoundDevice {
    kind: DeviceType,
    formats: FormatMask,
    min_channels: u32,
    max_channels: u32,
    rates: Vec<u32>,
    capabilities: DeviceCapabilities,
    routes: Vec<Route>,
    context: usize,
    flags: AtomicU32,
}

impl SoundDevice {
    pub fn new(
        kind: DeviceType,
        formats: FormatMask,
        min_channels: u32,
        max_channels: u32,
        mut rates: Vec<u32>,
        capabilities: DeviceCapabilities,
        routes: Vec<Route>,
        context: usize,
    ) -> Self {
        rates.sort_unstable();
        rates.dedup();
        SoundDevice {
            kind,
            formats,
            min_channels: min_channels.max(1),
            max_channels: max_channels.max(1),
            rates,
            capabilities,
            routes,
            context,
            flags: AtomicU32::new(0),
        }
    }

    pub fn kind(&self) -> DeviceType {
        self.kind
    }

    pub fn formats(&self) -> FormatMask {
        self.formats
    }

    pub fn min_channels(&self) -> u32 {
        self.min_channels
    }

    pub fn max_channels(&self) -> u32 {
        self.max_channels
    }

    /// Supported rates in Hz, ascending.
    pub fn rates(&self) -> &[u32] {
        &self.rates
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn primary_route(&self) -> Option<&Route> {
        self.routes.first()
    }

    /// The controller's opaque token for this endpoint.
    pub fn context(&self) -> usize {
        self.context
    }

    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Claims exclusive access. Returns false if another handle holds it.
    pub fn try_acquire(&self) -> bool {
        let prior = self.flags.fetch_or(DeviceFlags::BUSY.bits(), Ordering::AcqRel);
        prior & DeviceFlags::BUSY.bits() == 0
    }

    pub fn release(&self) {
        self.flags
            .fetch_and(!DeviceFlags::BUSY.bits(), Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(DeviceFlags::BUSY)
    }

    /// Atomically sets flag bits, returning the resulting word.
    pub fn set_flags(&self, bits: DeviceFlags) -> DeviceFlags {
        let prior = self.flags.fetch_or(bits.bits(), Ordering::AcqRel);
        DeviceFlags::from_bits_retain(prior | bits.bits())
    }

    /// Atomically clears flag bits, returning the resulting word.
    pub fn clear_flags(&self, bits: DeviceFlags) -> DeviceFlags {
        let prior = self.flags.fetch_and(!bits.bits(), Ordering::AcqRel);
        DeviceFlags::from_bits_retain(prior & !bits.bits())
    }

    pub fn enabled(&self, direction: DeviceType) -> bool {
        self.flags().contains(direction.enable_flag())
    }

    /// The supported rate closest to `desired`; ties go to the lower rate.
    pub fn nearest_rate(&self, desired: u32) -> Option<u32> {
        let mut best: Option<u32> = None;
        for &rate in &self.rates {
            match best {
                None => best = Some(rate),
                Some(current) => {
                    if rate.abs_diff(desired) < current.abs_diff(desired) {
                        best = Some(rate);
                    }
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(rates: Vec<u32>) -> SoundDevice {
        SoundDevice::new(
            DeviceType::Output,
            FormatMask::PCM16 | FormatMask::PCM8,
            1,
            2,
            rates,
            DeviceCapabilities::MMAP,
            Vec::new(),
            0,
        )
    }

    #[test]
    fn busy_is_exclusive() {
        let dev = device(vec![48000]);
        assert!(dev.try_acquire());
        assert!(!dev.try_acquire());
        dev.release();
        assert!(dev.try_acquire());
    }

    #[test]
    fn nearest_rate_prefers_lower_on_tie() {
        let dev = device(vec![8000, 16000, 22050, 44100, 48000]);
        assert_eq!(dev.nearest_rate(17000), Some(16000));
        assert_eq!(dev.nearest_rate(48000), Some(48000));
        assert_eq!(dev.nearest_rate(500_000), Some(48000));

        let dev = device(vec![16000, 48000]);
        assert_eq!(dev.nearest_rate(32000), Some(16000));
    }

    #[test]
    fn lowest_format_bit() {
        assert_eq!(
            (FormatMask::PCM16 | FormatMask::PCM32).lowest(),
            FormatMask::PCM16
        );
        assert_eq!(FormatMask::empty().lowest(), FormatMask::empty());
    }

    #[test]
    fn enable_flags_follow_direction() {
        let dev = device(vec![48000]);
        dev.set_flags(DeviceFlags::ENABLE_OUTPUT);
        assert!(dev.enabled(DeviceType::Output));
        assert!(!dev.enabled(DeviceType::Input));
        dev.clear_flags(DeviceFlags::ENABLE_OUTPUT);
        assert!(!dev.enabled(DeviceType::Output));
    }
}
