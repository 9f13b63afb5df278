use std::ptr;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

use common::dma::Dma;
use common::io::{Io, Mmio};
use common::timeout::Timeout;

use soundcore::{Error, Result};

pub type CodecAddr = u8;
/// Codec address plus node id on that codec.
pub type WidgetAddr = (CodecAddr, u16);

/// Link-layer limit on codec addresses.
pub const MAX_CODECS: usize = 16;

/// Offset of the command register block from the controller base.
pub const COMMAND_REGS_OFFSET: usize = 0x40;

// CORBCTL
const CORBRUN: u8 = 1 << 1;

// CORBRP
const CORBRPRST: u16 = 1 << 15;

// RIRBWP
const RIRBWPRST: u16 = 1 << 15;

// RIRBCTL
const RINTCTL: u8 = 1 << 0;
const RIRBDMAEN: u8 = 1 << 1;

// ICS
const ICB: u16 = 1 << 0;
const IRV: u16 = 1 << 1;

// Register sub-blocks, relative to controller base + 0x40.
const CORB_OFFSET: usize = 0x00;
const RIRB_OFFSET: usize = 0x10;
const ICMD_OFFSET: usize = 0x20;

// Ring memory split inside one page.
const CORB_BUFF_MAX_SIZE: usize = 1024;

// Response extension word.
const RESP_EX_UNSOLICITED: u32 = 1 << 4;

/// The transport every codec access goes through. The command ring is one
/// implementation; tests substitute a scripted codec model.
pub trait VerbIo {
    fn verb(&mut self, addr: WidgetAddr, verb: u32, payload: u32) -> Result<u32>;

    /// Completes once every verb already queued to `codec` has answered.
    fn barrier(&mut self, codec: CodecAddr) -> Result<()>;
}

/// Packs one command word.
///
/// Verb ids at or below 0xF carry a 16-bit payload; the longer ids carry
/// 8 bits.
pub fn encode_verb(addr: WidgetAddr, verb: u32, payload: u32) -> Result<u32> {
    let mut word = ((addr.0 as u32 & 0xF) << 28) | ((addr.1 as u32 & 0xFF) << 20);
    if verb <= 0xF {
        if payload > 0xFFFF {
            return Err(Error::InvalidParameter);
        }
        word |= (verb << 16) | payload;
    } else {
        if verb > 0xFFF || payload > 0xFF {
            return Err(Error::InvalidParameter);
        }
        word |= (verb << 8) | payload;
    }
    Ok(word)
}

#[allow(dead_code)]
struct CorbRegs {
    corblbase: Mmio<u32>,
    corbubase: Mmio<u32>,
    corbwp: Mmio<u16>,
    corbrp: Mmio<u16>,
    corbctl: Mmio<u8>,
    corbsts: Mmio<u8>,
    corbsize: Mmio<u8>,
    rsvd: Mmio<u8>,
}

struct Corb {
    regs: &'static mut CorbRegs,
    base: *mut u32,
    base_phys: usize,
    count: usize,
}

impl Corb {
    unsafe fn new(regs_addr: usize, base_phys: usize, base: *mut u32) -> Corb {
        Corb {
            regs: &mut *(regs_addr as *mut CorbRegs),
            base,
            base_phys,
            count: 0,
        }
    }

    /// Picks the largest ring the hardware advertises and points the engine
    /// at our buffer.
    fn init(&mut self) -> Result<()> {
        self.stop()?;

        let size_reg = self.regs.corbsize.read();
        let capability = (size_reg >> 4) & 0x7;
        let (encoding, count) = if capability & 0x4 != 0 {
            (2, 256)
        } else if capability & 0x2 != 0 {
            (1, 16)
        } else if capability & 0x1 != 0 {
            (0, 2)
        } else {
            log::error!("command ring size capability is empty");
            return Err(Error::InvalidConfiguration);
        };
        self.count = count;
        self.regs.corbsize.write((size_reg & 0xFC) | encoding);

        self.regs
            .corblbase
            .write((self.base_phys & 0xFFFF_FFFF) as u32);
        self.regs
            .corbubase
            .write(((self.base_phys as u64) >> 32) as u32);

        self.reset_read_pointer()?;
        self.regs.corbwp.write(0);
        Ok(())
    }

    fn start(&mut self) {
        self.regs.corbctl.writef(CORBRUN, true);
    }

    fn stop(&mut self) -> Result<()> {
        let timeout = Timeout::from_secs(1);
        while self.regs.corbctl.readf(CORBRUN) {
            self.regs.corbctl.writef(CORBRUN, false);
            timeout.run().map_err(|()| {
                log::error!("timeout stopping command ring DMA");
                Error::Timeout
            })?;
        }
        Ok(())
    }

    fn reset_read_pointer(&mut self) -> Result<()> {
        self.stop()?;

        let timeout = Timeout::from_secs(1);
        self.regs.corbrp.writef(CORBRPRST, true);
        while !self.regs.corbrp.readf(CORBRPRST) {
            self.regs.corbrp.writef(CORBRPRST, true);
            timeout.run().map_err(|()| {
                log::error!("timeout asserting command ring pointer reset");
                Error::Timeout
            })?;
        }

        let timeout = Timeout::from_secs(1);
        self.regs.corbrp.writef(CORBRPRST, false);
        while self.regs.corbrp.readf(CORBRPRST) {
            self.regs.corbrp.writef(CORBRPRST, false);
            timeout.run().map_err(|()| {
                log::error!("timeout clearing command ring pointer reset");
                Error::Timeout
            })?;
        }
        Ok(())
    }

    /// Queues one command word, spinning while the ring is full.
    fn push(&mut self, word: u32) -> Result<()> {
        let timeout = Timeout::from_secs(1);
        let next = ((self.regs.corbwp.read() as usize & 0xFF) + 1) % self.count;
        while next == (self.regs.corbrp.read() as usize & 0xFF) {
            timeout.run().map_err(|()| {
                log::error!("command ring stayed full");
                Error::Timeout
            })?;
        }
        unsafe {
            ptr::write_volatile(self.base.add(next), word);
        }
        self.regs.corbwp.write(next as u16);
        log::trace!("verb out: {:08X}", word);
        Ok(())
    }
}

#[allow(dead_code)]
struct RirbRegs {
    rirblbase: Mmio<u32>,
    rirbubase: Mmio<u32>,
    rirbwp: Mmio<u16>,
    rintcnt: Mmio<u16>,
    rirbctl: Mmio<u8>,
    rirbsts: Mmio<u8>,
    rirbsize: Mmio<u8>,
    rsvd: Mmio<u8>,
}

struct Rirb {
    regs: &'static mut RirbRegs,
    base: *const u64,
    base_phys: usize,
    read_pointer: usize,
    count: usize,
}

impl Rirb {
    unsafe fn new(regs_addr: usize, base_phys: usize, base: *const u64) -> Rirb {
        Rirb {
            regs: &mut *(regs_addr as *mut RirbRegs),
            base,
            base_phys,
            read_pointer: 0,
            count: 0,
        }
    }

    fn init(&mut self) -> Result<()> {
        self.stop()?;

        let size_reg = self.regs.rirbsize.read();
        let capability = (size_reg >> 4) & 0x7;
        let (encoding, count) = if capability & 0x4 != 0 {
            (2, 256)
        } else if capability & 0x2 != 0 {
            (1, 16)
        } else if capability & 0x1 != 0 {
            (0, 2)
        } else {
            log::error!("response ring size capability is empty");
            return Err(Error::InvalidConfiguration);
        };
        self.count = count;
        self.regs.rirbsize.write((size_reg & 0xFC) | encoding);

        self.regs
            .rirblbase
            .write((self.base_phys & 0xFFFF_FFFF) as u32);
        self.regs
            .rirbubase
            .write(((self.base_phys as u64) >> 32) as u32);

        self.regs.rirbwp.writef(RIRBWPRST, true);
        self.read_pointer = 0;

        // Interrupt after every response.
        self.regs.rintcnt.write(1);
        Ok(())
    }

    fn start(&mut self) {
        self.regs.rirbctl.writef(RIRBDMAEN | RINTCTL, true);
    }

    fn stop(&mut self) -> Result<()> {
        let timeout = Timeout::from_secs(1);
        while self.regs.rirbctl.readf(RIRBDMAEN) {
            self.regs.rirbctl.writef(RIRBDMAEN, false);
            timeout.run().map_err(|()| {
                log::error!("timeout stopping response ring DMA");
                Error::Timeout
            })?;
        }
        Ok(())
    }

    fn write_pointer(&self) -> usize {
        self.regs.rirbwp.read() as usize & 0xFF
    }

    /// Pops the next (response, extension) pair; caller checked occupancy.
    fn pop(&mut self) -> (u32, u32) {
        let next = (self.read_pointer + 1) % self.count;
        let entry = unsafe { ptr::read_volatile(self.base.add(next)) };
        self.read_pointer = next;
        ((entry & 0xFFFF_FFFF) as u32, (entry >> 32) as u32)
    }
}

#[allow(dead_code)]
struct ImmediateRegs {
    icoi: Mmio<u32>,
    irii: Mmio<u32>,
    ics: Mmio<u16>,
    rsvd: [Mmio<u8>; 6],
}

struct ImmediateCommand {
    regs: &'static mut ImmediateRegs,
}

impl ImmediateCommand {
    unsafe fn new(regs_addr: usize) -> ImmediateCommand {
        ImmediateCommand {
            regs: &mut *(regs_addr as *mut ImmediateRegs),
        }
    }

    fn cmd(&mut self, word: u32) -> Result<u64> {
        let timeout = Timeout::from_secs(1);
        while self.regs.ics.readf(ICB) {
            timeout.run().map_err(|()| {
                log::error!("immediate interface stayed busy");
                Error::Timeout
            })?;
        }

        self.regs.icoi.write(word);
        self.regs.ics.writef(ICB, true);

        let timeout = Timeout::from_secs(1);
        while !self.regs.ics.readf(IRV) {
            timeout.run().map_err(|()| {
                log::error!("no immediate response");
                Error::Timeout
            })?;
        }

        let mut response = self.regs.irii.read() as u64;
        response |= (self.regs.irii.read() as u64) << 32;
        self.regs.ics.writef(IRV, false);
        Ok(response)
    }
}

struct RingInner {
    corb: Corb,
    rirb: Rirb,
    imm: ImmediateCommand,
    immediate_mode: bool,
    // Keeps the ring memory mapped for the life of the engines.
    _mem: Dma<[u32; 1024]>,
}

// Raw ring pointers are only touched under the command lock.
unsafe impl Send for RingInner {}

/// Command and response rings to the codecs.
///
/// One lock serializes write-pointer advance and response reaping; verb
/// completion is tracked per codec so a waiter never sleeps holding it.
/// Responses are reaped both from interrupt context and opportunistically
/// by waiters, so a lost interrupt only costs latency. Hardware that
/// corrupts ring DMA is driven through the immediate-command registers
/// instead.
pub struct CommandRing {
    inner: spin::Mutex<RingInner>,
    pending: [AtomicU32; MAX_CODECS],
    last_response: [AtomicU32; MAX_CODECS],
    unsolicited: AtomicUsize,
}

impl CommandRing {
    /// `regs_addr` points at the command block (controller base + 0x40).
    pub unsafe fn new(regs_addr: usize) -> Result<CommandRing> {
        let mem = Dma::<[u32; 1024]>::zeroed()
            .map_err(|_| Error::InsufficientResources)?
            .assume_init();
        log::debug!(
            "command rings at {:#X} (physical {:#X})",
            mem.as_ptr() as usize,
            mem.physical()
        );

        let corb = Corb::new(
            regs_addr + CORB_OFFSET,
            mem.physical(),
            mem.as_ptr().cast(),
        );
        let rirb = Rirb::new(
            regs_addr + RIRB_OFFSET,
            mem.physical() + CORB_BUFF_MAX_SIZE,
            mem.as_ptr()
                .cast::<u8>()
                .wrapping_add(CORB_BUFF_MAX_SIZE)
                .cast(),
        );
        let imm = ImmediateCommand::new(regs_addr + ICMD_OFFSET);

        Ok(CommandRing {
            inner: spin::Mutex::new(RingInner {
                corb,
                rirb,
                imm,
                immediate_mode: false,
                _mem: mem,
            }),
            pending: Default::default(),
            last_response: Default::default(),
            unsolicited: AtomicUsize::new(0),
        })
    }

    /// Brings both rings up. `immediate_mode` bypasses ring DMA entirely
    /// for hardware that mishandles it.
    pub fn init(&self, immediate_mode: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.corb.init()?;
        inner.rirb.init()?;
        inner.immediate_mode = immediate_mode;
        if immediate_mode {
            log::debug!("using immediate command interface");
        } else {
            inner.corb.start();
            inner.rirb.start();
        }
        Ok(())
    }

    /// Halts ring DMA, e.g. ahead of a controller reset.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.corb.stop()?;
        inner.rirb.stop()?;
        Ok(())
    }

    /// Drains the response ring. Called from interrupt context and from
    /// waiters; returns how many responses were consumed.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock();
        self.reap_locked(&mut inner)
    }

    fn reap_locked(&self, inner: &mut RingInner) -> usize {
        let mut reaped = 0;
        while inner.rirb.count != 0 && inner.rirb.read_pointer != inner.rirb.write_pointer() {
            let (response, extension) = inner.rirb.pop();
            let codec = (extension as usize) & (MAX_CODECS - 1);
            if extension & RESP_EX_UNSOLICITED != 0 {
                // Jack and sense events are acknowledged but not surfaced.
                self.unsolicited.fetch_add(1, Ordering::Relaxed);
            } else {
                self.last_response[codec].store(response, Ordering::Release);
                fence(Ordering::Release);
                if self.pending[codec].load(Ordering::Relaxed) > 0 {
                    self.pending[codec].fetch_sub(1, Ordering::Release);
                } else {
                    log::warn!("spurious response {:08X} from codec {}", response, codec);
                }
            }
            log::trace!("verb in: {:08X} ext {:08X}", response, extension);
            reaped += 1;
        }
        reaped
    }

    fn wait_codec(&self, codec: CodecAddr) -> Result<u32> {
        let codec = codec as usize & (MAX_CODECS - 1);
        let timeout = Timeout::from_secs(1);
        loop {
            {
                let mut inner = self.inner.lock();
                self.reap_locked(&mut inner);
            }
            if self.pending[codec].load(Ordering::Acquire) == 0 {
                fence(Ordering::Acquire);
                return Ok(self.last_response[codec].load(Ordering::Acquire));
            }
            timeout.run().map_err(|()| {
                log::error!("codec {} stopped answering", codec);
                Error::Timeout
            })?;
        }
    }

    /// Queues one verb; optionally waits for the codec to drain and
    /// returns its latest response.
    pub fn get_set_verb(
        &self,
        addr: WidgetAddr,
        verb: u32,
        payload: u32,
        want_response: bool,
    ) -> Result<u32> {
        let word = encode_verb(addr, verb, payload)?;
        let codec = addr.0 as usize & (MAX_CODECS - 1);
        {
            let mut inner = self.inner.lock();
            if inner.immediate_mode {
                let response = inner.imm.cmd(word)?;
                return Ok(response as u32);
            }
            self.pending[codec].fetch_add(1, Ordering::Relaxed);
            if let Err(err) = inner.corb.push(word) {
                self.pending[codec].fetch_sub(1, Ordering::Release);
                return Err(err);
            }
        }
        if want_response {
            self.wait_codec(addr.0)
        } else {
            Ok(0)
        }
    }

    /// Program-order barrier: every verb already queued to `codec` has
    /// been answered when this returns.
    pub fn command_barrier(&self, codec: CodecAddr) -> Result<()> {
        self.wait_codec(codec).map(|_| ())
    }

    /// Unsolicited responses seen (and dropped) so far.
    pub fn unsolicited_count(&self) -> usize {
        self.unsolicited.load(Ordering::Relaxed)
    }
}

impl VerbIo for &CommandRing {
    fn verb(&mut self, addr: WidgetAddr, verb: u32, payload: u32) -> Result<u32> {
        self.get_set_verb(addr, verb, payload, true)
    }

    fn barrier(&mut self, codec: CodecAddr) -> Result<()> {
        self.command_barrier(codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_encodings() {
        // Long form: 12-bit verb id, 8-bit payload.
        assert_eq!(encode_verb((0, 0x14), 0xF00, 0x09).unwrap(), 0x01_4F_00_09);
        // Short form: 4-bit verb id, 16-bit payload.
        assert_eq!(encode_verb((2, 0x03), 0x2, 0x4011).unwrap(), 0x20_32_40_11);
        assert_eq!(encode_verb((0, 0), 0x3, 0xB035).unwrap(), 0x00_03_B0_35);

        assert_eq!(encode_verb((0, 1), 0xF00, 0x1FF), Err(Error::InvalidParameter));
        assert_eq!(encode_verb((0, 1), 0x2, 0x1_0000), Err(Error::InvalidParameter));
        assert_eq!(encode_verb((0, 1), 0x1000, 0), Err(Error::InvalidParameter));
    }

    // A zeroed page standing in for the command register block. The
    // capability nibbles are seeded so ring sizing can pick 256 entries.
    fn register_page() -> Box<[u8]> {
        let mut page = vec![0u8; 0x40].into_boxed_slice();
        page[0x0E] = 0x40; // corbsize capability
        page[0x1E] = 0x40; // rirbsize capability
        page
    }

    #[test]
    fn ring_setup_and_round_trip() {
        let mut page = register_page();
        let base = page.as_mut_ptr() as usize;
        let ring = unsafe { CommandRing::new(base).unwrap() };
        ring.init(false).unwrap();

        {
            let inner = ring.inner.lock();
            assert_eq!(inner.corb.count, 256);
            assert_eq!(inner.rirb.count, 256);
            // Size encoding 2 selects the 256-entry rings.
            assert_eq!(page[0x0E] & 0x3, 2);
            assert_eq!(page[0x1E] & 0x3, 2);
            // Both engines are running; the response interrupt fires per entry.
            assert_eq!(page[0x0C] & CORBRUN, CORBRUN);
            assert_eq!(page[0x1C] & (RIRBDMAEN | RINTCTL), RIRBDMAEN | RINTCTL);
            assert_eq!(u16::from_le_bytes([page[0x1A], page[0x1B]]), 1);
        }

        // Queue a verb; the word lands at slot 1 and the write pointer follows.
        let word = encode_verb((0, 0x02), 0xF00, 0x04).unwrap();
        ring.get_set_verb((0, 0x02), 0xF00, 0x04, false).unwrap();
        let (corb_ptr, rirb_ptr) = {
            let inner = ring.inner.lock();
            (inner.corb.base, inner.rirb.base)
        };
        unsafe {
            assert_eq!(ptr::read_volatile(corb_ptr.add(1)), word);
        }
        assert_eq!(u16::from_le_bytes([page[0x08], page[0x09]]), 1);
        assert_eq!(ring.pending[0].load(Ordering::Relaxed), 1);

        // The "codec" answers: response lands in the ring, hardware write
        // pointer advances, and a reap settles the pending count.
        unsafe {
            ptr::write_volatile(rirb_ptr.add(1) as *mut u64, 0x0000_0000_1234_5678);
        }
        page[0x18] = 1;
        assert_eq!(ring.reap(), 1);
        assert_eq!(ring.pending[0].load(Ordering::Relaxed), 0);
        assert_eq!(ring.wait_codec(0).unwrap(), 0x1234_5678);
    }

    #[test]
    fn unsolicited_responses_are_counted_and_dropped() {
        let mut page = register_page();
        let base = page.as_mut_ptr() as usize;
        let ring = unsafe { CommandRing::new(base).unwrap() };
        ring.init(false).unwrap();

        let rirb_ptr = ring.inner.lock().rirb.base;
        unsafe {
            let ext = (RESP_EX_UNSOLICITED as u64) << 32;
            ptr::write_volatile(rirb_ptr.add(1) as *mut u64, ext | 0xAAAA_BBBB);
        }
        page[0x18] = 1;

        assert_eq!(ring.reap(), 1);
        assert_eq!(ring.unsolicited_count(), 1);
        assert_eq!(ring.pending[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn missing_size_capability_is_rejected() {
        let mut page = vec![0u8; 0x40].into_boxed_slice();
        let base = page.as_mut_ptr() as usize;
        let ring = unsafe { CommandRing::new(base).unwrap() };
        assert_eq!(ring.init(false), Err(Error::InvalidConfiguration));
    }
}
