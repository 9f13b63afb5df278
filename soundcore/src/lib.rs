//! Core of the sound subsystem.
//!
//! Mediates between a file-like interface (open/read/write/control/poll)
//! and a hardware controller driver. Each open handle owns a cyclic audio
//! buffer shared with the controller's DMA engine, holds exclusive access
//! to its device, and walks a small lifecycle: uninitialized until the
//! first transfer, initialized once the buffer exists, running while DMA
//! moves data.

pub mod device;
pub mod error;
pub mod event;
pub mod handle;
pub mod host;
pub mod ring;
pub mod subsystem;

pub use self::device::{
    DeviceCapabilities, DeviceFlags, DeviceType, FormatMask, Route, RouteType, SoundDevice,
};
pub use self::error::{Error, Result};
pub use self::event::{EventState, IoEvent, WaitTimeout};
pub use self::handle::{BufferWindow, ControlRequest, ControlReply, QueueInformation, SoundHandle};
pub use self::host::{
    DeviceState, HostInterface, HostRegistration, InfoReply, InfoRequest, StateRequest,
    StreamConfig, Volume,
};
pub use self::ring::{AudioBuffer, RingBuffer};
pub use self::subsystem::{
    DirectoryEntry, EntryType, ListingStatus, SoundCore, SubsystemInformation, SUBSYSTEM_VERSION,
};
