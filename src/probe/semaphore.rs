//! USDT semaphore handling.
//!
//! Probes built with semaphores only fire while the semaphore (a u16 in the
//! target's data segment) is non-zero. We locate it through
//! `/proc/<pid>/maps`, bump it on attach and drop it again on detach.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

/// Parse the contents of a `/proc/<pid>/maps` file. Malformed lines are skipped.
pub fn parse_maps(contents: &str) -> Vec<MapEntry> {
    contents.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let _perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    // The path may contain spaces; take the remainder of the line.
    let path = fields
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(" (deleted)")
        .to_string();

    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        path: (!path.is_empty()).then(|| PathBuf::from(path)),
    })
}

/// Runtime address of the byte at `file_offset` of `binary`, if mapped.
pub fn resolve_address(maps: &[MapEntry], binary: &Path, file_offset: u64) -> Option<u64> {
    maps.iter()
        .filter(|m| m.path.as_deref() == Some(binary))
        .find(|m| file_offset >= m.offset && file_offset - m.offset < m.end - m.start)
        .map(|m| m.start + (file_offset - m.offset))
}

/// Semaphores incremented in a target process, released on drop or `release_all`.
#[derive(Debug)]
pub struct Semaphores {
    pid: u32,
    binary: PathBuf,
    maps: Vec<MapEntry>,
    held: Vec<u64>,
}

impl Semaphores {
    /// Snapshot the target's mappings for later semaphore resolution.
    pub fn open(pid: u32, binary: &Path) -> Result<Self> {
        let maps_path = format!("/proc/{pid}/maps");
        let contents = std::fs::read_to_string(&maps_path)
            .with_context(|| format!("reading {maps_path}"))?;
        let binary = binary
            .canonicalize()
            .with_context(|| format!("resolving {}", binary.display()))?;

        Ok(Self {
            pid,
            binary,
            maps: parse_maps(&contents),
            held: Vec::new(),
        })
    }

    /// Runtime address of `file_offset` of the target binary.
    pub fn address_of(&self, file_offset: u64) -> Option<u64> {
        resolve_address(&self.maps, &self.binary, file_offset)
    }

    /// Increment the semaphore at `file_offset` of the target binary.
    pub fn acquire(&mut self, file_offset: u64) -> Result<u64> {
        let Some(addr) = resolve_address(&self.maps, &self.binary, file_offset) else {
            bail!(
                "semaphore at file offset {file_offset:#x} is not mapped in pid {}",
                self.pid
            );
        };
        adjust(self.pid, addr, 1)?;
        self.held.push(addr);
        debug!(pid = self.pid, addr = %format!("{addr:#x}"), "USDT semaphore acquired");
        Ok(addr)
    }

    /// Decrement every semaphore acquired so far.
    pub fn release_all(&mut self) {
        for addr in self.held.drain(..) {
            if let Err(e) = adjust(self.pid, addr, -1) {
                // The target may already be gone.
                debug!(pid = self.pid, error = %e, "releasing USDT semaphore");
            }
        }
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

impl Drop for Semaphores {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(count = self.held.len(), "releasing USDT semaphores on drop");
            self.release_all();
        }
    }
}

/// Add `delta` to the u16 semaphore at `addr` in the target's memory.
fn adjust(pid: u32, addr: u64, delta: i16) -> Result<()> {
    let mem_path = format!("/proc/{pid}/mem");
    let mem = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&mem_path)
        .with_context(|| format!("opening {mem_path}"))?;

    let mut buf = [0u8; 2];
    mem.read_exact_at(&mut buf, addr)
        .with_context(|| format!("reading semaphore at {addr:#x}"))?;
    let value = u16::from_ne_bytes(buf).saturating_add_signed(delta);
    mem.write_all_at(&value.to_ne_bytes(), addr)
        .with_context(|| format!("writing semaphore at {addr:#x}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c8a00000-55d0c8c3e000 r--p 00000000 fd:01 1835043                    /usr/local/bin/bitcoind
55d0c8c3e000-55d0c9400000 r-xp 0023e000 fd:01 1835043                    /usr/local/bin/bitcoind
55d0c9400000-55d0c9480000 rw-p 00a00000 fd:01 1835043                    /usr/local/bin/bitcoind
55d0ca000000-55d0ca021000 rw-p 00000000 00:00 0                          [heap]
7f1c2d000000-7f1c2d001000 rw-p 00000000 00:00 0
7f1c2e000000-7f1c2e200000 r-xp 00000000 fd:01 42                         /opt/my lib/libfoo.so (deleted)
garbage line
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS);
        assert_eq!(maps.len(), 6);
        assert_eq!(maps[0].start, 0x55d0c8a00000);
        assert_eq!(maps[1].offset, 0x23e000);
        assert_eq!(maps[3].path.as_deref(), Some(Path::new("[heap]")));
        assert_eq!(maps[4].path, None);
        assert_eq!(maps[5].path.as_deref(), Some(Path::new("/opt/my lib/libfoo.so")));
    }

    #[test]
    fn test_resolve_address() {
        let maps = parse_maps(MAPS);
        let bin = Path::new("/usr/local/bin/bitcoind");

        assert_eq!(
            resolve_address(&maps, bin, 0xa00010),
            Some(0x55d0c9400000 + 0x10)
        );
        assert_eq!(resolve_address(&maps, bin, 0x100), Some(0x55d0c8a00100));
        assert_eq!(resolve_address(&maps, bin, 0xd00000), None);
        assert_eq!(resolve_address(&maps, Path::new("/usr/bin/other"), 0x100), None);
    }
}
