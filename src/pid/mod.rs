use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Linux comm names are truncated to 15 bytes.
const COMM_LEN: usize = 15;

/// Handle on a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Find the single running process executing `binary`.
    ///
    /// A process matches when its `exe` link resolves to the binary, or when
    /// its comm equals the binary's file name. Zero or several matches are
    /// errors; the operator must then pass the pid explicitly.
    pub fn discover(&self, binary: &Path) -> Result<u32> {
        let pids = self.candidates(binary)?;
        match pids.as_slice() {
            [] => bail!(
                "no running process found for {}; is bitcoind running? (set pid explicitly to skip discovery)",
                binary.display()
            ),
            [pid] => {
                debug!(pid, binary = %binary.display(), "discovered target process");
                Ok(*pid)
            }
            many => bail!(
                "multiple processes match {}: {:?}; set pid explicitly",
                binary.display(),
                many
            ),
        }
    }

    /// Every pid whose executable or comm matches `binary`, ascending.
    pub fn candidates(&self, binary: &Path) -> Result<Vec<u32>> {
        let canonical = binary.canonicalize().ok();
        let comm_name = binary
            .file_name()
            .map(|n| truncate_comm(&n.to_string_lossy()).to_string());
        let own_pid = std::process::id();

        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?;

        let mut pids = Vec::with_capacity(4);
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            if pid == own_pid {
                continue;
            }

            let exe_match = match (&canonical, self.exe(pid)) {
                (Some(want), Some(exe)) => &exe == want,
                _ => false,
            };
            let comm_match = match (&comm_name, self.comm(pid)) {
                (Some(want), Some(comm)) => &comm == want,
                _ => false,
            };

            if exe_match || comm_match {
                debug!(pid, exe_match, comm_match, "found matching process");
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }

    /// Check that `pid` exists and runs `binary`.
    ///
    /// A missing process is an error. A different executable is only
    /// logged: the probes are resolved against `binary` regardless.
    pub fn verify_binary(&self, pid: u32, binary: &Path) -> Result<()> {
        if !self.pid_dir(pid).exists() {
            bail!("process {pid} not found");
        }

        let Some(exe) = self.exe(pid) else {
            warn!(pid, "cannot read process executable; skipping binary verification");
            return Ok(());
        };
        let want = binary
            .canonicalize()
            .with_context(|| format!("resolving {}", binary.display()))?;

        if exe != want {
            warn!(
                pid,
                exe = %exe.display(),
                bitcoind_path = %want.display(),
                "process executable differs from bitcoind_path"
            );
        }
        Ok(())
    }

    /// Whether `pid` exists and is not a zombie.
    pub fn is_alive(&self, pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(self.pid_dir(pid).join("stat")) else {
            return false;
        };
        !matches!(stat_state(&stat), Some('Z' | 'X'))
    }

    fn exe(&self, pid: u32) -> Option<PathBuf> {
        let link = std::fs::read_link(self.pid_dir(pid).join("exe")).ok()?;
        let s = link.to_string_lossy();
        match s.strip_suffix(" (deleted)") {
            Some(stripped) => Some(PathBuf::from(stripped)),
            None => Some(link),
        }
    }

    fn comm(&self, pid: u32) -> Option<String> {
        std::fs::read_to_string(self.pid_dir(pid).join("comm"))
            .ok()
            .map(|c| c.trim().to_string())
    }
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_LEN {
        return name;
    }
    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Process state character from /proc/<pid>/stat. The comm field may itself
/// contain spaces and parentheses, so parse after the last ')'.
fn stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}
