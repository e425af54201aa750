//! USDT (SystemTap SDT) probe discovery.
//!
//! Reads the `.note.stapsdt` notes of the target binary and turns each
//! probe's argument description (`-4@%eax`, `8@-16(%rbp)`, `8@[sp, 16]`, ...)
//! into a fetch recipe the BPF program can evaluate against `pt_regs`.

use std::fmt;
use std::path::Path;

use object::{Object, ObjectSection, ObjectSegment};
use thiserror::Error;

/// Maximum number of arguments captured per probe (matches fibre.h).
pub const MAX_USDT_ARGS: usize = 6;

const NT_STAPSDT: u32 = 3;
const STAPSDT_NOTE_NAME: &[u8] = b"stapsdt\0";
const NOTE_SECTION: &str = ".note.stapsdt";
const BASE_SECTION: &str = ".stapsdt.base";

/// Errors produced while reading USDT notes.
#[derive(Error, Debug)]
pub enum UsdtError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing ELF: {0}")]
    Elf(#[from] object::Error),

    #[error("unsupported ELF: {0}")]
    UnsupportedElf(&'static str),

    #[error("malformed stapsdt note at offset {offset}")]
    MalformedNote { offset: usize },

    #[error("unsupported USDT argument spec {spec:?}")]
    UnsupportedArg { spec: String },

    #[error("unknown register {reg:?} in USDT argument spec")]
    UnknownRegister { reg: String },

    #[error("address {addr:#x} is not covered by any loadable segment")]
    UnmappedAddress { addr: u64 },
}

impl UsdtError {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Elf(_) | Self::UnsupportedElf(_) => "elf",
            Self::MalformedNote { .. } => "malformed_note",
            Self::UnsupportedArg { .. } | Self::UnknownRegister { .. } => "unsupported_arg",
            Self::UnmappedAddress { .. } => "unmapped_address",
        }
    }
}

/// Architecture whose calling convention the argument specs follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

/// How the BPF side obtains an argument value. Values match fibre.h.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArgKind {
    Const = 0,
    Reg = 1,
    RegDeref = 2,
}

/// Fetch recipe for one USDT argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsdtArg {
    pub kind: ArgKind,
    /// Constant value, or dereference offset for `RegDeref`.
    pub val_off: u64,
    /// Byte offset of the register within `struct pt_regs`.
    pub reg_off: i16,
    pub signed: bool,
    /// Shift used to truncate and sign/zero extend to 64 bits.
    pub bitshift: i8,
}

/// One probe site found in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsdtProbe {
    pub provider: String,
    pub name: String,
    /// Virtual address of the probe site.
    pub pc: u64,
    /// File offset of the probe site, as expected by uprobe attach.
    pub file_offset: u64,
    /// Virtual address of the semaphore, when the probe has one.
    pub semaphore_addr: Option<u64>,
    /// File offset of the semaphore, used to locate it in a live mapping.
    pub semaphore_offset: Option<u64>,
    pub args: Vec<UsdtArg>,
}

impl fmt::Display for UsdtProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{:#x}", self.provider, self.name, self.pc)
    }
}

/// A stapsdt note before address translation and argument parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNote {
    pub pc: u64,
    pub base: u64,
    pub semaphore: u64,
    pub provider: String,
    pub name: String,
    pub args: String,
}

/// Read all USDT probes from the binary at `path`.
pub fn probes_in_binary(path: &Path) -> Result<Vec<UsdtProbe>, UsdtError> {
    let data = std::fs::read(path).map_err(|source| UsdtError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_probes(&data)
}

/// Parse all USDT probes from an in-memory ELF image.
///
/// A binary without a `.note.stapsdt` section yields no probes.
pub fn parse_probes(data: &[u8]) -> Result<Vec<UsdtProbe>, UsdtError> {
    let file = object::File::parse(data)?;
    if !file.is_64() {
        return Err(UsdtError::UnsupportedElf("32-bit binaries are not supported"));
    }
    let arch = match file.architecture() {
        object::Architecture::X86_64 => Arch::X86_64,
        object::Architecture::Aarch64 => Arch::Aarch64,
        _ => return Err(UsdtError::UnsupportedElf("unsupported architecture")),
    };

    let Some(section) = file.section_by_name(NOTE_SECTION) else {
        return Ok(Vec::new());
    };
    let notes = parse_note_section(section.data()?, file.is_little_endian())?;
    let base_addr = file.section_by_name(BASE_SECTION).map(|s| s.address());

    let segments: Vec<(u64, u64, u64, u64)> = file
        .segments()
        .map(|seg| {
            let (offset, file_size) = seg.file_range();
            (seg.address(), seg.size(), offset, file_size)
        })
        .collect();
    let to_file_offset = |addr: u64| -> Result<u64, UsdtError> {
        segments
            .iter()
            .find(|(vaddr, size, _, file_size)| {
                addr >= *vaddr && addr - vaddr < *size && addr - vaddr < *file_size
            })
            .map(|(vaddr, _, offset, _)| addr - vaddr + offset)
            .ok_or(UsdtError::UnmappedAddress { addr })
    };

    let mut probes = Vec::with_capacity(notes.len());
    for note in notes {
        // Prelinked binaries: shift by the distance the base section moved.
        let (pc, semaphore) = match base_addr {
            Some(actual) if note.base != 0 => {
                let delta = actual.wrapping_sub(note.base);
                let sema = if note.semaphore != 0 {
                    note.semaphore.wrapping_add(delta)
                } else {
                    0
                };
                (note.pc.wrapping_add(delta), sema)
            }
            _ => (note.pc, note.semaphore),
        };

        let args = parse_arg_list(arch, &note.args)?;
        let semaphore_addr = (semaphore != 0).then_some(semaphore);
        let semaphore_offset = semaphore_addr.map(&to_file_offset).transpose()?;

        probes.push(UsdtProbe {
            provider: note.provider,
            name: note.name,
            pc,
            file_offset: to_file_offset(pc)?,
            semaphore_addr,
            semaphore_offset,
            args,
        });
    }

    Ok(probes)
}

/// Split a `.note.stapsdt` section into its notes.
pub fn parse_note_section(data: &[u8], little_endian: bool) -> Result<Vec<RawNote>, UsdtError> {
    let read_u32 = |at: usize| -> Option<u32> {
        let bytes: [u8; 4] = data.get(at..at + 4)?.try_into().ok()?;
        Some(if little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    };
    let read_u64 = |buf: &[u8], at: usize| -> Option<u64> {
        let bytes: [u8; 8] = buf.get(at..at + 8)?.try_into().ok()?;
        Some(if little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    };

    let mut notes = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let malformed = UsdtError::MalformedNote { offset };
        let (Some(namesz), Some(descsz), Some(kind)) =
            (read_u32(offset), read_u32(offset + 4), read_u32(offset + 8))
        else {
            return Err(malformed);
        };

        let name_start = offset + 12;
        let desc_start = name_start + align4(namesz as usize);
        let next = desc_start + align4(descsz as usize);
        let (Some(name), Some(desc)) = (
            data.get(name_start..name_start + namesz as usize),
            data.get(desc_start..desc_start + descsz as usize),
        ) else {
            return Err(malformed);
        };

        if kind == NT_STAPSDT && name == STAPSDT_NOTE_NAME {
            let (Some(pc), Some(base), Some(semaphore)) =
                (read_u64(desc, 0), read_u64(desc, 8), read_u64(desc, 16))
            else {
                return Err(malformed);
            };

            let mut strings = desc[24..].split(|&b| b == 0);
            let (Some(provider), Some(name)) = (strings.next(), strings.next()) else {
                return Err(malformed);
            };
            let args = strings.next().unwrap_or_default();
            if provider.is_empty() || name.is_empty() {
                return Err(malformed);
            }

            notes.push(RawNote {
                pc,
                base,
                semaphore,
                provider: String::from_utf8_lossy(provider).into_owned(),
                name: String::from_utf8_lossy(name).into_owned(),
                args: String::from_utf8_lossy(args).into_owned(),
            });
        }

        offset = next;
    }

    Ok(notes)
}

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Parse a whitespace-separated argument description.
///
/// Only the first [`MAX_USDT_ARGS`] arguments are kept.
pub fn parse_arg_list(arch: Arch, args: &str) -> Result<Vec<UsdtArg>, UsdtError> {
    split_args(args)
        .take(MAX_USDT_ARGS)
        .map(|spec| parse_arg_spec(arch, spec))
        .collect()
}

/// Split on spaces that are not inside `[...]`, so aarch64 `8@[sp, 16]`
/// stays one argument.
fn split_args(args: &str) -> impl Iterator<Item = &str> {
    let mut depth = 0i32;
    args.split(move |c: char| {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            _ => {}
        }
        c == ' ' && depth == 0
    })
    .filter(|s| !s.is_empty())
}

/// Parse one `size@location` argument spec.
pub fn parse_arg_spec(arch: Arch, spec: &str) -> Result<UsdtArg, UsdtError> {
    let unsupported = || UsdtError::UnsupportedArg {
        spec: spec.to_string(),
    };

    let (size, loc) = spec.split_once('@').ok_or_else(unsupported)?;
    let size: i32 = size.trim().parse().map_err(|_| unsupported())?;
    if !matches!(size.unsigned_abs(), 1 | 2 | 4 | 8) {
        return Err(unsupported());
    }

    let (kind, val_off, reg_off) = match arch {
        Arch::X86_64 => parse_x86_location(loc).ok_or_else(unsupported)??,
        Arch::Aarch64 => parse_arm64_location(loc).ok_or_else(unsupported)??,
    };

    Ok(UsdtArg {
        kind,
        val_off,
        reg_off,
        signed: size < 0,
        bitshift: (64 - size.unsigned_abs() * 8) as i8,
    })
}

type Location = (ArgKind, u64, i16);

/// Outer `None` means the shape is unsupported; inner error names a bad register.
fn parse_x86_location(loc: &str) -> Option<Result<Location, UsdtError>> {
    if let Some(value) = loc.strip_prefix('$') {
        let value: i64 = value.parse().ok()?;
        return Some(Ok((ArgKind::Const, value as u64, 0)));
    }

    if let Some(reg) = loc.strip_prefix('%') {
        return Some(x86_reg(reg).map(|off| (ArgKind::Reg, 0, off)));
    }

    let (disp, rest) = loc.split_once('(')?;
    let inner = rest.strip_suffix(')')?;
    // Index/scale forms such as (%rbp,%rax,8) are not supported.
    let reg = inner.strip_prefix('%').filter(|r| !r.contains(','))?;
    let disp: i64 = if disp.is_empty() { 0 } else { disp.parse().ok()? };
    Some(x86_reg(reg).map(|off| (ArgKind::RegDeref, disp as u64, off)))
}

fn parse_arm64_location(loc: &str) -> Option<Result<Location, UsdtError>> {
    if let Some(inner) = loc.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        let (reg, disp) = match inner.split_once(',') {
            Some((reg, disp)) => (reg.trim(), disp.trim().parse::<i64>().ok()?),
            None => (inner.trim(), 0),
        };
        return Some(arm64_reg(reg).map(|off| (ArgKind::RegDeref, disp as u64, off)));
    }

    if let Ok(value) = loc.parse::<i64>() {
        return Some(Ok((ArgKind::Const, value as u64, 0)));
    }

    if loc.is_empty() || !loc.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(arm64_reg(loc).map(|off| (ArgKind::Reg, 0, off)))
}

/// Offset of an x86_64 register (any width alias) within `struct pt_regs`.
fn x86_reg(name: &str) -> Result<i16, UsdtError> {
    const REGS: &[(&[&str], i16)] = &[
        (&["r15", "r15d", "r15w", "r15b"], 0),
        (&["r14", "r14d", "r14w", "r14b"], 8),
        (&["r13", "r13d", "r13w", "r13b"], 16),
        (&["r12", "r12d", "r12w", "r12b"], 24),
        (&["rbp", "ebp", "bp", "bpl"], 32),
        (&["rbx", "ebx", "bx", "bl"], 40),
        (&["r11", "r11d", "r11w", "r11b"], 48),
        (&["r10", "r10d", "r10w", "r10b"], 56),
        (&["r9", "r9d", "r9w", "r9b"], 64),
        (&["r8", "r8d", "r8w", "r8b"], 72),
        (&["rax", "eax", "ax", "al"], 80),
        (&["rcx", "ecx", "cx", "cl"], 88),
        (&["rdx", "edx", "dx", "dl"], 96),
        (&["rsi", "esi", "si", "sil"], 104),
        (&["rdi", "edi", "di", "dil"], 112),
        (&["rip", "eip"], 128),
        (&["rsp", "esp", "sp", "spl"], 152),
    ];

    REGS.iter()
        .find(|(names, _)| names.contains(&name))
        .map(|(_, off)| *off)
        .ok_or_else(|| UsdtError::UnknownRegister {
            reg: name.to_string(),
        })
}

/// Offset of an aarch64 register within `struct user_pt_regs`.
fn arm64_reg(name: &str) -> Result<i16, UsdtError> {
    if name == "sp" {
        return Ok(248);
    }
    name.strip_prefix('x')
        .or_else(|| name.strip_prefix('w'))
        .and_then(|n| n.parse::<i16>().ok())
        .filter(|n| (0..=30).contains(n))
        .map(|n| n * 8)
        .ok_or_else(|| UsdtError::UnknownRegister {
            reg: name.to_string(),
        })
}
