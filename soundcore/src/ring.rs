use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::dma::Dma;

use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::event::{EventState, IoEvent};

/// One physically contiguous DMA region backing a cyclic buffer.
pub struct AudioBuffer {
    mem: Dma<[u8]>,
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("len", &self.mem.len())
            .finish_non_exhaustive()
    }
}

impl AudioBuffer {
    pub fn allocate(len: usize) -> Result<Self> {
        let mem = Dma::zeroed_slice(len).map_err(|_| Error::InsufficientResources)?;
        let mem = unsafe { mem.assume_init() };
        log::trace!("allocated {} byte audio buffer at {:#x}", len, mem.physical());
        Ok(AudioBuffer { mem })
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.len() == 0
    }

    pub fn physical(&self) -> usize {
        self.mem.physical()
    }

    fn base(&self) -> *mut u8 {
        self.mem.as_ptr().cast()
    }
}

/// Cyclic buffer shared between the software side and the controller's DMA
/// engine.
///
/// `software_offset` belongs to the task side: it is the producer cursor on
/// playback and the consumer cursor on capture. `hardware_offset` advances
/// from interrupt context as DMA completes fragments. Both stay below
/// `size`; equality means no work is possible in the caller's direction.
/// The buffer bytes follow the single-producer/single-consumer discipline:
/// the software side only touches `[software_offset, software_offset + available)`.
pub struct RingBuffer {
    buffer: AudioBuffer,
    fragment_size: usize,
    fragment_count: usize,
    direction: DeviceType,
    software_offset: AtomicUsize,
    hardware_offset: AtomicUsize,
    event: Arc<IoEvent>,
}

impl RingBuffer {
    /// Wraps a DMA region. `fragment_size` and `fragment_count` must be
    /// powers of two with `fragment_count >= 2`, and their product must fit
    /// the region.
    ///
    /// Initial cursor placement depends on direction: capture starts empty
    /// (both cursors at zero); playback starts with the hardware cursor
    /// parked at `size - 1` so the engine does not run ahead of the first
    /// written byte.
    pub fn new(
        buffer: AudioBuffer,
        fragment_size: usize,
        fragment_count: usize,
        direction: DeviceType,
        event: Arc<IoEvent>,
    ) -> Self {
        let size = fragment_size * fragment_count;
        debug_assert!(fragment_size.is_power_of_two());
        debug_assert!(fragment_count.is_power_of_two() && fragment_count >= 2);
        debug_assert!(size <= buffer.len());

        let hardware_offset = match direction {
            DeviceType::Input => 0,
            DeviceType::Output => size - 1,
        };
        let ring = RingBuffer {
            buffer,
            fragment_size,
            fragment_count,
            direction,
            software_offset: AtomicUsize::new(0),
            hardware_offset: AtomicUsize::new(hardware_offset),
            event,
        };
        ring.refresh_signal();
        ring
    }

    pub fn size(&self) -> usize {
        self.fragment_size * self.fragment_count
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    pub fn direction(&self) -> DeviceType {
        self.direction
    }

    pub fn event(&self) -> &Arc<IoEvent> {
        &self.event
    }

    pub fn physical(&self) -> usize {
        self.buffer.physical()
    }

    /// Bus address of one fragment, for descriptor programming.
    pub fn fragment_physical(&self, index: usize) -> usize {
        debug_assert!(index < self.fragment_count);
        self.buffer.physical() + index * self.fragment_size
    }

    pub fn software_offset(&self) -> usize {
        self.software_offset.load(Ordering::Acquire)
    }

    pub fn hardware_offset(&self) -> usize {
        self.hardware_offset.load(Ordering::Acquire)
    }

    /// Bytes the software side may move right now: data waiting on capture,
    /// free space on playback.
    pub fn available(&self) -> usize {
        let software = self.software_offset();
        let hardware = self.hardware_offset();
        hardware.wrapping_sub(software) & (self.size() - 1)
    }

    /// Moves the software cursor after a copy and republishes readiness.
    pub fn advance_software(&self, bytes: usize) {
        let next = (self.software_offset() + bytes) & (self.size() - 1);
        self.software_offset.store(next, Ordering::Release);
        self.refresh_signal();
    }

    /// Publishes a new hardware position (interrupt side) and republishes
    /// readiness.
    pub fn update_hardware(&self, position: usize) {
        self.hardware_offset
            .store(position & (self.size() - 1), Ordering::Release);
        self.refresh_signal();
    }

    /// Recomputes the readiness bit from both cursors.
    ///
    /// Lock-free handshake with the other side: after publishing the bit,
    /// re-read both cursors and repeat until the snapshot held still. A
    /// concurrent move by the other party therefore cannot leave a sleeper
    /// behind a stale bit.
    pub fn refresh_signal(&self) {
        let ready = match self.direction {
            DeviceType::Input => EventState::READABLE,
            DeviceType::Output => EventState::WRITABLE,
        };
        loop {
            let software = self.software_offset.load(Ordering::Acquire);
            let hardware = self.hardware_offset.load(Ordering::Acquire);
            if software == hardware {
                self.event.clear(ready);
            } else {
                self.event.set(ready);
            }
            if self.software_offset.load(Ordering::Acquire) == software
                && self.hardware_offset.load(Ordering::Acquire) == hardware
            {
                break;
            }
        }
    }

    /// The at-most-two contiguous pieces of `[offset, offset + len)`.
    fn spans(&self, offset: usize, len: usize) -> [(usize, usize); 2] {
        let size = self.size();
        debug_assert!(offset < size && len <= size);
        let first = len.min(size - offset);
        [(offset, first), (0, len - first)]
    }

    /// Copies into the ring at `offset`, wrapping once if needed.
    ///
    /// Caller is the software side and must stay within `available()`.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        let base = self.buffer.base();
        let mut consumed = 0;
        for (start, len) in self.spans(offset, src.len()) {
            if len == 0 {
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(src[consumed..].as_ptr(), base.add(start), len);
            }
            consumed += len;
        }
    }

    /// Copies out of the ring at `offset`, wrapping once if needed.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let base = self.buffer.base();
        let mut produced = 0;
        for (start, len) in self.spans(offset, dst.len()) {
            if len == 0 {
                continue;
            }
            unsafe {
                ptr::copy_nonoverlapping(base.add(start), dst[produced..].as_mut_ptr(), len);
            }
            produced += len;
        }
    }

    /// Non-wrapping read for live buffer windows; returns bytes copied.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let size = self.size();
        if offset >= size {
            return 0;
        }
        let len = dst.len().min(size - offset);
        unsafe {
            ptr::copy_nonoverlapping(self.buffer.base().add(offset), dst.as_mut_ptr(), len);
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(direction: DeviceType) -> RingBuffer {
        let buffer = AudioBuffer::allocate(4096).unwrap();
        RingBuffer::new(buffer, 2048, 2, direction, Arc::new(IoEvent::new()))
    }

    #[test]
    fn capture_starts_empty() {
        let ring = ring(DeviceType::Input);
        assert_eq!(ring.software_offset(), 0);
        assert_eq!(ring.hardware_offset(), 0);
        assert_eq!(ring.available(), 0);
        assert!(!ring.event().state().contains(EventState::READABLE));
    }

    #[test]
    fn playback_starts_full() {
        let ring = ring(DeviceType::Output);
        assert_eq!(ring.software_offset(), 0);
        assert_eq!(ring.hardware_offset(), 4095);
        assert_eq!(ring.available(), 4095);
        assert!(ring.event().state().contains(EventState::WRITABLE));
    }

    #[test]
    fn occupancy_tracks_cursors() {
        let ring = ring(DeviceType::Input);
        ring.update_hardware(2048);
        assert_eq!(ring.available(), 2048);
        assert!(ring.event().state().contains(EventState::READABLE));

        ring.advance_software(2048);
        assert_eq!(ring.available(), 0);
        assert!(!ring.event().state().contains(EventState::READABLE));
    }

    #[test]
    fn signal_clears_when_playback_fills() {
        let ring = ring(DeviceType::Output);
        ring.advance_software(4095);
        assert_eq!(ring.software_offset(), 4095);
        assert_eq!(ring.available(), 0);
        assert!(!ring.event().state().contains(EventState::WRITABLE));

        // A fragment completes; space opens again.
        ring.update_hardware(2048);
        assert_eq!(ring.available(), 2049);
        assert!(ring.event().state().contains(EventState::WRITABLE));
    }

    #[test]
    fn copy_wraps_across_the_end() {
        let ring = ring(DeviceType::Output);
        let data: Vec<u8> = (0..100u8).collect();
        ring.copy_in(4060, &data);

        let mut out = vec![0u8; 100];
        ring.copy_out(4060, &mut out);
        assert_eq!(out, data);

        // The tail landed at the front of the region.
        let mut head = vec![0u8; 64];
        ring.copy_out(0, &mut head);
        assert_eq!(&head[..64], &data[36..100]);
    }

    #[test]
    fn wrap_returns_to_zero() {
        let ring = ring(DeviceType::Output);
        ring.advance_software(4095);
        ring.update_hardware(2048);
        ring.advance_software(1);
        assert_eq!(ring.software_offset(), 0);
    }

    #[test]
    fn window_read_clamps() {
        let ring = ring(DeviceType::Output);
        let mut buf = vec![0u8; 8192];
        assert_eq!(ring.read_at(4000, &mut buf), 96);
        assert_eq!(ring.read_at(4096, &mut buf), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn cursors_stay_in_bounds(moves in proptest::collection::vec((0usize..8192, any::<bool>()), 1..64)) {
                let ring = ring(DeviceType::Input);
                for (amount, hardware) in moves {
                    if hardware {
                        ring.update_hardware(amount);
                    } else {
                        let step = amount.min(ring.available());
                        ring.advance_software(step);
                    }
                    prop_assert!(ring.software_offset() < ring.size());
                    prop_assert!(ring.hardware_offset() < ring.size());
                    prop_assert!(ring.available() < ring.size());
                }
            }

            #[test]
            fn readiness_matches_occupancy(hw in 0usize..4096, sw_step in 0usize..4096) {
                let ring = ring(DeviceType::Input);
                ring.update_hardware(hw);
                let step = sw_step.min(ring.available());
                ring.advance_software(step);
                let readable = ring.event().state().contains(EventState::READABLE);
                prop_assert_eq!(readable, ring.available() != 0);
            }
        }
    }
}
