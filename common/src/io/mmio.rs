use core::cmp::PartialEq;
use core::mem::MaybeUninit;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr::{addr_of, addr_of_mut};

use crate::io::Io;

/// A memory-mapped register cell. Register blocks are `#[repr(C, packed)]`
/// structs of these, overlaid on a mapped hardware window; all access is
/// volatile so the compiler never elides or reorders device reads/writes.
#[repr(transparent)]
pub struct Mmio<T> {
    value: MaybeUninit<T>,
}

impl<T> Mmio<T> {
    pub fn zeroed() -> Self {
        Mmio {
            value: MaybeUninit::zeroed(),
        }
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    fn read(&self) -> T {
        unsafe { addr_of!(self.value).cast::<T>().read_volatile() }
    }

    fn write(&mut self, value: T) {
        unsafe { addr_of_mut!(self.value).cast::<T>().write_volatile(value) }
    }
}
