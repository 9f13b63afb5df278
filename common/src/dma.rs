use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr;

use crate::PAGE_SIZE;

/// The allocator could not satisfy a DMA request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

/// Page-aligned, zero-initialized, physically contiguous memory suitable
/// for device DMA.
///
/// Addresses reported by [`Dma::physical`] assume the identity mapping the
/// hosting kernel applies to this allocator's pool. An embedding that
/// translates through an IOMMU supplies its own buffers at the host
/// interface instead of relying on this allocator.
pub struct Dma<T: ?Sized> {
    phys: usize,
    aligned_len: usize,
    virt: *mut T,
}

// The allocation is exclusively owned; the raw pointer never aliases
// another Dma.
unsafe impl<T: Send + ?Sized> Send for Dma<T> {}
unsafe impl<T: Sync + ?Sized> Sync for Dma<T> {}

fn alloc_block(len: usize) -> Result<(usize, usize, *mut u8), AllocError> {
    let aligned_len = len.next_multiple_of(PAGE_SIZE).max(PAGE_SIZE);
    let layout = Layout::from_size_align(aligned_len, PAGE_SIZE).map_err(|_| AllocError)?;
    let virt = unsafe { alloc_zeroed(layout) };
    if virt.is_null() {
        return Err(AllocError);
    }
    log::trace!("dma: {} bytes at {:#x}", aligned_len, virt as usize);
    Ok((virt as usize, aligned_len, virt))
}

impl<T> Dma<T> {
    pub fn new(value: T) -> Result<Self, AllocError> {
        let zeroed = Self::zeroed()?;
        unsafe {
            zeroed.virt.cast::<T>().write(value);
            Ok(zeroed.assume_init())
        }
    }

    pub fn zeroed() -> Result<Dma<MaybeUninit<T>>, AllocError> {
        let (phys, aligned_len, virt) = alloc_block(mem::size_of::<T>())?;
        Ok(Dma {
            phys,
            aligned_len,
            virt: virt.cast(),
        })
    }
}

impl<T> Dma<MaybeUninit<T>> {
    pub unsafe fn assume_init(self) -> Dma<T> {
        let Dma {
            phys,
            aligned_len,
            virt,
        } = self;
        mem::forget(self);

        Dma {
            phys,
            aligned_len,
            virt: virt.cast(),
        }
    }
}

impl<T> Dma<[T]> {
    pub fn zeroed_slice(count: usize) -> Result<Dma<[MaybeUninit<T>]>, AllocError> {
        let len = count.checked_mul(mem::size_of::<T>()).ok_or(AllocError)?;
        let (phys, aligned_len, virt) = alloc_block(len)?;
        Ok(Dma {
            phys,
            aligned_len,
            virt: ptr::slice_from_raw_parts_mut(virt.cast(), count),
        })
    }
}

impl<T> Dma<[MaybeUninit<T>]> {
    pub unsafe fn assume_init(self) -> Dma<[T]> {
        let &Dma {
            phys,
            aligned_len,
            virt,
        } = &self;
        mem::forget(self);

        Dma {
            phys,
            aligned_len,
            virt: virt as *mut [T],
        }
    }
}

impl<T: ?Sized> Dma<T> {
    pub fn physical(&self) -> usize {
        self.phys
    }

    pub fn as_ptr(&self) -> *mut T {
        self.virt
    }
}

impl<T: ?Sized> Deref for Dma<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.virt }
    }
}

impl<T: ?Sized> DerefMut for Dma<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.virt }
    }
}

impl<T: ?Sized> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.virt);
            let layout = Layout::from_size_align_unchecked(self.aligned_len, PAGE_SIZE);
            dealloc(self.virt.cast(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_slice_is_zeroed() {
        let dma = unsafe { Dma::<[u8]>::zeroed_slice(3 * PAGE_SIZE + 17).unwrap().assume_init() };
        assert_eq!(dma.len(), 3 * PAGE_SIZE + 17);
        assert!(dma.iter().all(|&b| b == 0));
        assert_eq!(dma.physical() % PAGE_SIZE, 0);
    }

    #[test]
    fn value_round_trip() {
        let mut dma = Dma::new([0u32; 8]).unwrap();
        dma[3] = 0xDEAD_BEEF;
        assert_eq!(dma[3], 0xDEAD_BEEF);
        assert_eq!(dma[0], 0);
    }
}
