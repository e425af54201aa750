//! BPF program loading, USDT attachment, and ring buffer reading.
//!
//! Implements [`ProbeSource`] using aya. One uprobe program is attached to
//! every USDT site of every known probe; the program looks up the site's
//! argument recipe by instruction pointer in the `usdt_sites` map.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;

use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::RingBuf;
use aya::programs::UProbe;
use aya::{Ebpf, EbpfLoader};

use super::parse::split_record;
use super::semaphore::Semaphores;
use super::usdt::{probes_in_binary, UsdtArg, UsdtProbe, MAX_USDT_ARGS};
use super::{AttachReport, EventSink, ProbeDef, ProbeSource, PROBES};

/// Compiled BPF object, embedded at build time.
///
/// Uses `include_bytes_aligned!` to guarantee 32-byte alignment. Without this,
/// `include_bytes!` provides only 1-byte alignment and `aya-obj`'s ELF parser
/// rejects the data when the pointer lands at a non-8-byte-aligned address.
#[cfg(target_os = "linux")]
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/fibre.bpf.o"));

const PROGRAM_NAME: &str = "fibre_usdt";

/// Must match FIBRE_MAX_SITES in fibre.h.
const MAX_SITES: usize = 64;

/// BPF map value for one argument (matches `struct usdt_arg_spec` in fibre.h).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct BpfArgSpec {
    val_off: u64,
    arg_kind: u32,
    reg_off: i16,
    arg_signed: u8,
    arg_bitshift: i8,
}

/// BPF map value for usdt_sites (matches `struct usdt_site` in fibre.h).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct BpfUsdtSite {
    probe_id: u8,
    arg_cnt: u8,
    string_mask: u8,
    _pad: [u8; 5],
    args: [BpfArgSpec; MAX_USDT_ARGS],
}

// SAFETY: plain C structs; explicit padding, no implicit holes.
unsafe impl aya::Pod for BpfArgSpec {}
unsafe impl aya::Pod for BpfUsdtSite {}

impl From<&UsdtArg> for BpfArgSpec {
    fn from(arg: &UsdtArg) -> Self {
        Self {
            val_off: arg.val_off,
            arg_kind: arg.kind as u32,
            reg_off: arg.reg_off,
            arg_signed: u8::from(arg.signed),
            arg_bitshift: arg.bitshift,
        }
    }
}

fn site_value(def: &ProbeDef, probe: &UsdtProbe) -> BpfUsdtSite {
    let mut site = BpfUsdtSite {
        probe_id: def.id as u8,
        arg_cnt: probe.args.len().min(MAX_USDT_ARGS) as u8,
        string_mask: def
            .string_args
            .iter()
            .fold(0u8, |mask, n| mask | (1 << (n - 1))),
        ..Default::default()
    };
    for (slot, arg) in site.args.iter_mut().zip(&probe.args) {
        *slot = arg.into();
    }
    site
}

/// BPF-backed probe source for one bitcoind process.
pub struct BpfProbeSource {
    binary: PathBuf,
    pid: u32,
    ring_buf_size: u32,
    ebpf: Option<Ebpf>,
    semaphores: Option<Semaphores>,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl BpfProbeSource {
    pub fn new(binary: &Path, pid: u32, ring_buf_size: u32) -> Self {
        Self {
            binary: binary.to_path_buf(),
            pid,
            ring_buf_size,
            ebpf: None,
            semaphores: None,
            read_task: None,
        }
    }
}

impl ProbeSource for BpfProbeSource {
    async fn attach(&mut self) -> Result<AttachReport> {
        let binary = self
            .binary
            .canonicalize()
            .with_context(|| format!("resolving {}", self.binary.display()))?;
        let sites = probes_in_binary(&binary)
            .with_context(|| format!("reading USDT notes from {}", binary.display()))?;
        let mut semaphores = Semaphores::open(self.pid, &binary)?;

        let mut ebpf = EbpfLoader::new()
            .set_max_entries("events", self.ring_buf_size)
            .load(BPF_OBJ)
            .context("loading BPF objects (are CAP_BPF and CAP_PERFMON granted?)")?;

        // Loading the program is where missing privilege shows up; that is fatal.
        {
            let prog: &mut UProbe = ebpf
                .program_mut(PROGRAM_NAME)
                .ok_or_else(|| anyhow::anyhow!("program '{PROGRAM_NAME}' not found"))?
                .try_into()
                .with_context(|| format!("'{PROGRAM_NAME}' is not a uprobe program"))?;
            prog.load()
                .context("loading uprobe program (insufficient privilege?)")?;
        }

        let mut report = AttachReport::default();
        let mut inserted = 0usize;

        for def in PROBES {
            let matching: Vec<&UsdtProbe> = sites
                .iter()
                .filter(|s| s.provider == def.provider && s.name == def.name)
                .collect();

            if matching.is_empty() {
                tracing::warn!(probe = %def.qualified_name(), "probe not found in binary");
                report
                    .skipped
                    .push((def.id, "not found in binary".to_string()));
                continue;
            }

            let mut attached_sites = 0usize;
            let mut last_error = None;

            for site in matching {
                let result: Result<()> = (|| {
                    if inserted >= MAX_SITES {
                        anyhow::bail!("usdt_sites map is full ({MAX_SITES} sites)");
                    }
                    let ip = semaphores.address_of(site.file_offset).ok_or_else(|| {
                        anyhow::anyhow!("site {site} is not mapped in pid {}", self.pid)
                    })?;

                    let mut map: BpfHashMap<_, u64, BpfUsdtSite> = BpfHashMap::try_from(
                        ebpf.map_mut("usdt_sites")
                            .ok_or_else(|| anyhow::anyhow!("usdt_sites map not found"))?,
                    )?;
                    map.insert(ip, site_value(def, site), 0)
                        .with_context(|| format!("adding site {site} to BPF map"))?;
                    inserted += 1;

                    let prog: &mut UProbe = ebpf
                        .program_mut(PROGRAM_NAME)
                        .ok_or_else(|| anyhow::anyhow!("program '{PROGRAM_NAME}' not found"))?
                        .try_into()?;
                    prog.attach(None, site.file_offset, &binary, Some(self.pid as i32))
                        .with_context(|| format!("attaching uprobe at {site}"))?;

                    if let Some(offset) = site.semaphore_offset {
                        semaphores.acquire(offset)?;
                    }
                    Ok(())
                })();

                match result {
                    Ok(()) => {
                        attached_sites += 1;
                        tracing::debug!(site = %site, "attached USDT site");
                    }
                    Err(e) => {
                        tracing::warn!(site = %site, error = %e, "USDT site attach failed");
                        last_error = Some(e);
                    }
                }
            }

            if attached_sites > 0 {
                report.attached.push(def.id);
            } else {
                let reason = last_error.map_or_else(String::new, |e| format!("{e:#}"));
                report.skipped.push((def.id, reason));
            }
        }

        tracing::info!(
            attached = report.attached_count(),
            total = report.total(),
            semaphores = semaphores.held(),
            "USDT probe attachment summary"
        );

        self.semaphores = Some(semaphores);
        self.ebpf = Some(ebpf);
        Ok(report)
    }

    async fn start(&mut self, ctx: tokio_util::sync::CancellationToken, sink: EventSink) -> Result<()> {
        let ebpf = self
            .ebpf
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("BPF objects not loaded"))?;

        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow::anyhow!("events map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        self.read_task = Some(tokio::spawn(read_loop(ring_buf, sink, ctx)));

        tracing::info!(pid = self.pid, "BPF probe source started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // The read task exits when the CancellationToken is cancelled.
        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }

        if let Some(mut semaphores) = self.semaphores.take() {
            semaphores.release_all();
        }

        // Dropping the Ebpf object detaches all programs and closes maps.
        self.ebpf = None;

        tracing::info!("BPF probe source stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ring buffer read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    ring_buf: RingBuf<aya::maps::MapData>,
    sink: EventSink,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to create async fd for ring buffer");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "ring buffer poll error");
                        continue;
                    }
                };

                // Drain all available records.
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    match split_record(&item) {
                        Ok(raw) => {
                            if !sink.try_push(raw) {
                                tracing::debug!("event channel closed, stopping read loop");
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "ring buffer record rejected");
                            sink.record_truncated();
                        }
                    }
                }

                guard.clear_ready();
            }
        }
    }
}
