use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::device::{DeviceType, SoundDevice};
use crate::error::{Error, Result};
use crate::handle::SoundHandle;
use crate::host::{HostInterface, HostRegistration};

/// Version of the information record this library reports.
pub const SUBSYSTEM_VERSION: u32 = 1;

/// Longest device name, including the terminator an OS surface appends.
pub const MAX_DEVICE_NAME: usize = 20;

/// Read-only summary handed to management interfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubsystemInformation {
    pub version: u32,
    pub flags: u32,
    pub input_device_count: u32,
    pub output_device_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    CharacterDevice,
}

/// One name under the controller's listing.
#[derive(Clone, Debug)]
pub struct DirectoryEntry {
    pub name: String,
    pub file_id: u64,
    pub size: u64,
    /// Cursor value that resumes the walk after this entry.
    pub next_offset: usize,
    pub entry_type: EntryType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListingStatus {
    Complete,
    /// The caller's buffer filled before the walk finished.
    MoreProcessingRequired,
}

enum Lookup {
    Root,
    Any(DeviceType),
    Indexed(DeviceType, usize),
}

/// Root of the subsystem: the registered controller, its devices in
/// declaration order, and the open-handle accounting.
pub struct SoundCore {
    host: Arc<dyn HostInterface>,
    pub(crate) min_fragment_size: usize,
    pub(crate) max_fragment_size: usize,
    pub(crate) max_fragment_count: usize,
    pub(crate) max_buffer_size: usize,
    pub(crate) noncached_dma: bool,
    devices: Vec<Arc<SoundDevice>>,
    created_at: SystemTime,
    open_handles: AtomicUsize,
}

impl SoundCore {
    /// Registers a controller. Buffer limits must be sane powers of two;
    /// anything else is a controller bug surfaced immediately.
    pub fn new(host: Arc<dyn HostInterface>, registration: HostRegistration) -> Result<Arc<Self>> {
        let HostRegistration {
            min_fragment_size,
            max_fragment_size,
            max_fragment_count,
            max_buffer_size,
            noncached_dma,
            devices,
        } = registration;

        if !min_fragment_size.is_power_of_two()
            || !max_fragment_size.is_power_of_two()
            || min_fragment_size > max_fragment_size
            || max_fragment_count < 2
            || max_buffer_size < min_fragment_size * 2
        {
            return Err(Error::InvalidParameter);
        }

        log::debug!(
            "registering controller: {} devices, fragments {}..={} bytes, <= {} fragments, non-cached DMA: {}",
            devices.len(),
            min_fragment_size,
            max_fragment_size,
            max_fragment_count,
            noncached_dma
        );

        Ok(Arc::new(SoundCore {
            host,
            min_fragment_size,
            max_fragment_size,
            max_fragment_count,
            max_buffer_size,
            noncached_dma,
            devices,
            created_at: SystemTime::now(),
            open_handles: AtomicUsize::new(0),
        }))
    }

    pub fn host(&self) -> &Arc<dyn HostInterface> {
        &self.host
    }

    pub fn devices(&self) -> &[Arc<SoundDevice>] {
        &self.devices
    }

    pub fn device_count(&self, kind: DeviceType) -> usize {
        self.devices.iter().filter(|d| d.kind() == kind).count()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Whether the controller requires its DMA memory mapped non-cached.
    pub fn noncached_dma(&self) -> bool {
        self.noncached_dma
    }

    pub fn open_handle_count(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub(crate) fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }

    /// Opens a name under this controller.
    ///
    /// `""` (or `"/"`) opens the listing itself. `input`/`output` bind the
    /// first free device of that direction; `input3` binds the fourth
    /// capture device in declaration order. A bound device is exclusive
    /// until its handle drops.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<SoundHandle> {
        match Self::parse_path(path)? {
            Lookup::Root => Ok(SoundHandle::open_root(self.clone())),
            Lookup::Any(kind) => {
                let mut any_exist = false;
                for device in self.devices.iter().filter(|d| d.kind() == kind) {
                    any_exist = true;
                    if device.try_acquire() {
                        return Ok(SoundHandle::open_device(self.clone(), device.clone()));
                    }
                }
                Err(if any_exist {
                    Error::ResourceInUse
                } else {
                    Error::NotFound
                })
            }
            Lookup::Indexed(kind, index) => {
                let device = self
                    .devices
                    .iter()
                    .filter(|d| d.kind() == kind)
                    .nth(index)
                    .ok_or(Error::NotFound)?;
                if !device.try_acquire() {
                    return Err(Error::ResourceInUse);
                }
                Ok(SoundHandle::open_device(self.clone(), device.clone()))
            }
        }
    }

    fn parse_path(path: &str) -> Result<Lookup> {
        let name = path.trim_matches('/');
        if name.is_empty() {
            return Ok(Lookup::Root);
        }
        if name.len() >= MAX_DEVICE_NAME {
            return Err(Error::NotFound);
        }

        for (prefix, kind) in [("input", DeviceType::Input), ("output", DeviceType::Output)] {
            if let Some(rest) = name.strip_prefix(prefix) {
                if rest.is_empty() {
                    return Ok(Lookup::Any(kind));
                }
                if rest.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(index) = rest.parse::<usize>() {
                        return Ok(Lookup::Indexed(kind, index));
                    }
                }
                return Err(Error::NotFound);
            }
        }
        Err(Error::NotFound)
    }

    /// Names under the listing: indexed entries first, generic aliases last.
    pub(crate) fn directory_names(&self) -> Vec<String> {
        let inputs = self.device_count(DeviceType::Input);
        let outputs = self.device_count(DeviceType::Output);
        let mut names = Vec::with_capacity(inputs + outputs + 2);
        for index in 0..inputs {
            names.push(format!("input{}", index));
        }
        for index in 0..outputs {
            names.push(format!("output{}", index));
        }
        names.push("input".to_string());
        names.push("output".to_string());
        names
    }

    /// Walks the listing from `entry_offset`, yielding at most `capacity`
    /// entries. A cursor past the end reads as end-of-file.
    pub fn read_directory(
        &self,
        entry_offset: usize,
        capacity: usize,
    ) -> Result<(Vec<DirectoryEntry>, ListingStatus)> {
        let names = self.directory_names();
        if entry_offset >= names.len() {
            return Err(Error::EndOfFile);
        }

        let mut entries = Vec::new();
        for (index, name) in names.iter().enumerate().skip(entry_offset) {
            if entries.len() == capacity {
                return Ok((entries, ListingStatus::MoreProcessingRequired));
            }
            entries.push(DirectoryEntry {
                name: name.clone(),
                file_id: index as u64 + 1,
                size: 0,
                next_offset: index + 1,
                entry_type: EntryType::CharacterDevice,
            });
        }
        Ok((entries, ListingStatus::Complete))
    }

    /// The read-only information record. Callers must speak at least this
    /// library's version.
    pub fn information(&self, version: u32) -> Result<SubsystemInformation> {
        if version < SUBSYSTEM_VERSION {
            return Err(Error::InvalidParameter);
        }
        Ok(SubsystemInformation {
            version: SUBSYSTEM_VERSION,
            flags: 0,
            input_device_count: self.device_count(DeviceType::Input) as u32,
            output_device_count: self.device_count(DeviceType::Output) as u32,
        })
    }
}
