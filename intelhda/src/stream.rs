use std::sync::Arc;

use common::dma::Dma;
use common::io::{Io, Mmio};
use common::timeout::Timeout;

use soundcore::{DeviceType, Error, FormatMask, Result, RingBuffer};

use crate::regs::{
    StreamDescriptorRegs, SD_DIR_OUT, SD_IOCE, SD_RUN, SD_SRST, SD_TP,
};

/// Buffer descriptor list length; one entry per ring fragment.
pub const BDL_ENTRIES: usize = 8;

/// One buffer descriptor list entry, hardware layout.
#[repr(C)]
pub struct BdlEntry {
    addr_lo: Mmio<u32>,
    addr_hi: Mmio<u32>,
    length: Mmio<u32>,
    control: Mmio<u32>,
}

impl BdlEntry {
    pub fn address(&self) -> u64 {
        (self.addr_lo.read() as u64) | ((self.addr_hi.read() as u64) << 32)
    }

    pub fn set_address(&mut self, addr: u64) {
        self.addr_lo.write(addr as u32);
        self.addr_hi.write((addr >> 32) as u32);
    }

    pub fn length(&self) -> u32 {
        self.length.read()
    }

    pub fn set_length(&mut self, length: u32) {
        self.length.write(length);
    }

    pub fn interrupt_on_complete(&self) -> bool {
        self.control.read() & 1 == 1
    }

    pub fn set_interrupt_on_complete(&mut self, enable: bool) {
        self.control.writef(1, enable);
    }
}

/// A claimed descriptor slot plus the stream tag bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamAssignment {
    /// Global descriptor index: inputs, then outputs, then bidirectional.
    pub slot: usize,
    /// Link tag, 1..=15; tag 0 stays reserved.
    pub number: u8,
    /// The slot came from the bidirectional region.
    pub bidirectional: bool,
}

/// Allocator over the controller's descriptor regions and stream tags.
pub struct StreamPool {
    input: usize,
    output: usize,
    bidirectional: usize,
    slots: Vec<bool>,
    numbers: u16,
}

impl StreamPool {
    pub fn new(input: usize, output: usize, bidirectional: usize) -> StreamPool {
        StreamPool {
            input,
            output,
            bidirectional,
            slots: vec![false; input + output + bidirectional],
            // Tag 0 is never handed out.
            numbers: 1,
        }
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    fn find_free(&self, start: usize, len: usize) -> Option<usize> {
        (start..start + len).find(|&slot| !self.slots[slot])
    }

    /// Claims a slot matching the transfer direction (falling back to the
    /// bidirectional region) together with a free stream tag.
    pub fn allocate(&mut self, direction: DeviceType) -> Result<StreamAssignment> {
        let (start, len) = match direction {
            DeviceType::Input => (0, self.input),
            DeviceType::Output => (self.input, self.output),
        };
        let slot = self
            .find_free(start, len)
            .or_else(|| self.find_free(self.input + self.output, self.bidirectional))
            .ok_or(Error::ResourceInUse)?;

        let number = (1..16)
            .find(|&n| self.numbers & (1 << n) == 0)
            .ok_or(Error::ResourceInUse)?;

        self.slots[slot] = true;
        self.numbers |= 1 << number;
        Ok(StreamAssignment {
            slot,
            number: number as u8,
            bidirectional: slot >= self.input + self.output,
        })
    }

    pub fn free(&mut self, assignment: StreamAssignment) {
        self.slots[assignment.slot] = false;
        self.numbers &= !(1 << assignment.number);
    }
}

/// Encodes a converter/descriptor format word from negotiated parameters.
///
/// Float samples ride a 32-bit container; compressed passthrough rides a
/// 16-bit one.
pub fn format_word(rate: u32, format: FormatMask, channels: u32) -> Result<u16> {
    let (base_44k1, mult, div) = match rate {
        8000 => (false, 1, 6),
        11025 => (true, 1, 4),
        16000 => (false, 1, 3),
        22050 => (true, 1, 2),
        32000 => (false, 2, 3),
        44100 => (true, 1, 1),
        48000 => (false, 1, 1),
        88200 => (true, 2, 1),
        96000 => (false, 2, 1),
        176400 => (true, 4, 1),
        192000 => (false, 4, 1),
        _ => return Err(Error::InvalidConfiguration),
    };

    let bits: u16 = if format == FormatMask::PCM8 {
        0
    } else if format == FormatMask::PCM16 || format == FormatMask::AC3 {
        1
    } else if format == FormatMask::PCM20 {
        2
    } else if format == FormatMask::PCM24 {
        3
    } else if format == FormatMask::PCM32 || format == FormatMask::FLOAT32 {
        4
    } else {
        return Err(Error::InvalidConfiguration);
    };

    if channels == 0 || channels > 16 {
        return Err(Error::InvalidConfiguration);
    }

    let mut word: u16 = if base_44k1 { 1 << 14 } else { 0 };
    word |= ((mult - 1) & 0x7) << 11;
    word |= ((div - 1) & 0x7) << 8;
    word |= bits << 4;
    word |= (channels as u16 - 1) & 0xF;
    Ok(word)
}

/// Snaps a raw link position to the nearest fragment edge, modulo the ring.
/// Rounding to the closest edge compensates for FIFO slack in the raw
/// counter.
pub fn align_position(position: usize, fragment_size: usize, ring_size: usize) -> usize {
    let remainder = position % fragment_size;
    let mut aligned = position - remainder;
    if remainder * 2 >= fragment_size {
        aligned += fragment_size;
    }
    aligned % ring_size
}

/// A live transfer bound to one descriptor slot.
pub struct StreamRuntime {
    regs: &'static mut StreamDescriptorRegs,
    bdl: Dma<[BdlEntry; BDL_ENTRIES]>,
    assignment: StreamAssignment,
    ring: Arc<RingBuffer>,
}

impl StreamRuntime {
    /// Binds a descriptor's register window. The caller guarantees
    /// `regs_addr` points at the slot named by `assignment` and stays
    /// mapped for the runtime's lifetime.
    pub unsafe fn new(
        regs_addr: usize,
        assignment: StreamAssignment,
        ring: Arc<RingBuffer>,
    ) -> Result<StreamRuntime> {
        let bdl = Dma::<[BdlEntry; BDL_ENTRIES]>::zeroed()
            .map_err(|_| Error::InsufficientResources)?
            .assume_init();
        Ok(StreamRuntime {
            regs: &mut *(regs_addr as *mut StreamDescriptorRegs),
            bdl,
            assignment,
            ring,
        })
    }

    pub fn assignment(&self) -> StreamAssignment {
        self.assignment
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn interrupt_bit(&self) -> u32 {
        1 << self.assignment.slot
    }

    /// Resets the descriptor engine, tolerating hardware that never
    /// reflects the reset bit back.
    fn reset(&mut self) {
        self.regs.set_control(self.regs.control() | SD_SRST);
        let timeout = Timeout::from_millis(20);
        while self.regs.control() & SD_SRST == 0 {
            if timeout.run().is_err() {
                log::debug!(
                    "slot {}: reset assertion never read back",
                    self.assignment.slot
                );
                break;
            }
        }

        self.regs.set_control(self.regs.control() & !SD_SRST);
        let timeout = Timeout::from_millis(20);
        while self.regs.control() & SD_SRST != 0 {
            if timeout.run().is_err() {
                log::debug!(
                    "slot {}: reset release never read back",
                    self.assignment.slot
                );
                break;
            }
        }
    }

    /// Resets the slot and programs one descriptor entry per ring
    /// fragment, all interrupting on completion.
    pub fn configure(&mut self, format: u16) -> Result<()> {
        let fragments = self.ring.fragment_count();
        if fragments > BDL_ENTRIES {
            return Err(Error::InvalidConfiguration);
        }

        // A bidirectional slot must pick its direction before any other
        // descriptor register is touched.
        if self.assignment.bidirectional && self.ring.direction() == DeviceType::Output {
            self.regs.set_control(SD_DIR_OUT);
        }

        self.reset();

        for index in 0..fragments {
            self.bdl[index].set_address(self.ring.fragment_physical(index) as u64);
            self.bdl[index].set_length(self.ring.fragment_size() as u32);
            self.bdl[index].set_interrupt_on_complete(true);
        }

        // Descriptor state survives in ours; the base is re-programmed
        // after the engine reset above.
        self.regs.set_bdl_address(self.bdl.physical() as u64);
        self.regs
            .set_cyclic_buffer_length(self.ring.size() as u32);
        self.regs.set_last_valid_index(fragments as u16 - 1);
        self.regs.set_format(format);
        self.regs.set_stream_number(self.assignment.number);
        log::debug!(
            "slot {}: stream {} format {:04X}, {} x {} bytes",
            self.assignment.slot,
            self.assignment.number,
            format,
            fragments,
            self.ring.fragment_size()
        );
        Ok(())
    }

    /// Turns the DMA engine loose.
    pub fn start_dma(&mut self) {
        self.regs
            .set_control(self.regs.control() | SD_TP | SD_IOCE | SD_RUN);
    }

    /// Quiesces the engine: interrupts and DMA off, wait for the run bit
    /// to fall, then scrub the format register (some emulated controllers
    /// replay stale formats otherwise).
    pub fn stop_dma(&mut self) {
        self.regs
            .set_control(self.regs.control() & !(SD_IOCE | SD_RUN));
        let timeout = Timeout::from_millis(20);
        while self.regs.control() & SD_RUN != 0 {
            if timeout.run().is_err() {
                log::warn!("slot {}: DMA refused to stop", self.assignment.slot);
                break;
            }
        }
        self.regs.set_format(0);
    }

    /// The hardware cursor, fragment-aligned and wrapped to the ring.
    pub fn position(&self) -> usize {
        align_position(
            self.regs.link_position() as usize,
            self.ring.fragment_size(),
            self.ring.size(),
        )
    }
}
