use std::fs;
use std::path::Path;

use log::{debug, warn};
use thiserror::Error;

const PROC_SELF_MAPS: &str = "/proc/self/maps";

#[derive(Error, Debug)]
pub enum MapsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed maps line {line}: '{text}'")]
    Parse { line: usize, text: String },
}

/// One line of the kernel's self-map description.
///
/// `end` is exclusive, as the kernel prints it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: u64,
    pub inode: u64,
    pub name: String,
}

impl MapEntry {
    /// Parses `hexstart-hexend perms offset dev:dev inode [name]`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        let perms = fields.next()?.to_string();
        let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
        let _device = fields.next()?.split_once(':')?;
        let inode = fields.next()?.parse().ok()?;
        // Paths may contain spaces; everything after the inode is the name.
        let name = fields.collect::<Vec<_>>().join(" ");

        if start > end {
            return None;
        }
        Some(Self { start, end, perms, offset, inode, name })
    }

    /// True if `addr` lies inside `[start, end)`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Parses a whole maps text, one entry per non-empty line.
pub fn parse_maps(text: &str) -> Result<Vec<MapEntry>, MapsError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            MapEntry::parse(line).ok_or_else(|| MapsError::Parse { line: i + 1, text: line.to_string() })
        })
        .collect()
}

/// Source of the current process's mapped regions.
pub trait AddressSpaceSource {
    fn regions(&self) -> Result<Vec<MapEntry>, MapsError>;
}

/// Reads `/proc/self/maps`.
pub struct ProcSelfMaps;

impl AddressSpaceSource for ProcSelfMaps {
    fn regions(&self) -> Result<Vec<MapEntry>, MapsError> {
        let text = fs::read_to_string(PROC_SELF_MAPS).map_err(|source| MapsError::Io { path: PROC_SELF_MAPS, source })?;
        parse_maps(&text)
    }
}

/// Fixed maps text, for replaying a captured address space.
pub struct StaticMaps(pub String);

impl AddressSpaceSource for StaticMaps {
    fn regions(&self) -> Result<Vec<MapEntry>, MapsError> {
        parse_maps(&self.0)
    }
}

/// End addresses of the program's read-only text and initialised data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBounds {
    pub text_end: usize,
    pub data_end: usize,
}

impl ImageBounds {
    /// Looks up the linker-provided `etext`/`edata` symbols, falling back to
    /// the executable's own mappings when they are not exported.
    pub fn discover(regions: &[MapEntry]) -> Option<Self> {
        if let (Some(text_end), Some(data_end)) = (lookup_symbol(b"etext\0"), lookup_symbol(b"edata\0")) {
            debug!("Image bounds from symbols: etext={:#x} edata={:#x}", text_end, data_end);
            return Some(Self { text_end, data_end });
        }

        let exe = fs::read_link("/proc/self/exe").ok()?;
        let bounds = Self::from_executable_mappings(regions, &exe);
        if bounds.is_none() {
            warn!("Could not locate text/data mappings of {}", exe.display());
        }
        bounds
    }

    /// Text ends with the last executable mapping of `exe`, data with its
    /// last writable one.
    pub fn from_executable_mappings(regions: &[MapEntry], exe: &Path) -> Option<Self> {
        let exe = exe.to_string_lossy();
        let own: Vec<&MapEntry> = regions.iter().filter(|r| r.name == exe).collect();
        let text_end = own.iter().filter(|r| r.perms.contains('x')).map(|r| r.end).max()?;
        let data_end = own.iter().filter(|r| r.perms.starts_with("rw")).map(|r| r.end).max()?;
        Some(Self { text_end, data_end })
    }
}

fn lookup_symbol(name: &[u8]) -> Option<usize> {
    // SAFETY: name is NUL-terminated; dlsym does not retain it.
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr() as *const libc::c_char) };
    (!addr.is_null()).then_some(addr as usize)
}
