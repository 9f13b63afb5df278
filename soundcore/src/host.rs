use std::sync::Arc;

use crate::device::{FormatMask, SoundDevice};
use crate::error::Result;
use crate::ring::{AudioBuffer, RingBuffer};

/// Lifecycle of a handle's transfer machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// No buffer exists; only negotiation is possible.
    Uninitialized,
    /// The buffer is allocated and the path is programmed.
    Initialized,
    /// DMA is moving data.
    Running,
}

/// Per-channel level, 0..=100.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Volume {
    pub left: u8,
    pub right: u8,
}

impl Volume {
    pub const fn flat(level: u8) -> Self {
        Volume {
            left: level,
            right: level,
        }
    }

    pub fn pack(self) -> u32 {
        (self.left as u32) | ((self.right as u32) << 8)
    }

    pub fn unpack(raw: u32) -> Self {
        Volume {
            left: ((raw & 0xFF) as u8).min(100),
            right: (((raw >> 8) & 0xFF) as u8).min(100),
        }
    }

    pub fn is_muted(self) -> bool {
        self.left == 0 && self.right == 0
    }
}

/// Everything the controller needs to arm a transfer.
#[derive(Clone)]
pub struct StreamConfig {
    pub ring: Arc<RingBuffer>,
    /// Exactly one bit of the device's supported mask.
    pub format: FormatMask,
    pub channels: u32,
    pub rate: u32,
    pub volume: Volume,
}

/// Requested lifecycle edge.
pub enum StateRequest {
    Uninitialized,
    Initialized(StreamConfig),
    Running,
}

/// One get/set exchange with the controller.
pub enum InfoRequest {
    SetState(StateRequest),
    GetState,
    SetVolume(Volume),
    GetVolume,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoReply {
    Done,
    State(DeviceState),
    Volume(Volume),
}

/// What a controller declares when it registers its devices.
#[derive(Clone)]
pub struct HostRegistration {
    pub min_fragment_size: usize,
    pub max_fragment_size: usize,
    pub max_fragment_count: usize,
    pub max_buffer_size: usize,
    /// DMA memory must be mapped non-cached on this platform.
    pub noncached_dma: bool,
    /// Published endpoints, in the controller's declaration order.
    pub devices: Vec<Arc<SoundDevice>>,
}

/// Operations a host controller supplies to the sound core.
///
/// `get_set_info` is required and drives the device state machine and
/// per-route volume. The allocation hooks have working defaults: plain
/// physically contiguous memory from the shared allocator, released when
/// the last reference to the ring goes away. Controllers with stricter
/// placement rules (alignment windows, IOMMU translation, non-cached
/// mappings) override them.
pub trait HostInterface: Send + Sync {
    fn get_set_info(&self, device: &Arc<SoundDevice>, request: InfoRequest) -> Result<InfoReply>;

    fn alloc_dma_buffer(
        &self,
        device: &Arc<SoundDevice>,
        fragment_size: usize,
        fragment_count: usize,
    ) -> Result<AudioBuffer> {
        let _ = device;
        AudioBuffer::allocate(fragment_size * fragment_count)
    }

    fn free_dma_buffer(&self, device: &Arc<SoundDevice>, ring: &Arc<RingBuffer>) {
        let _ = (device, ring);
    }
}
