//! Build-time version info.

/// Release version string (set at build time).
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// Git commit hash (set at build time via env, or "unknown").
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}

/// Full version string with platform info.
pub fn full() -> String {
    format!(
        "{} (commit: {}, {}/{}, bpf: {})",
        RELEASE,
        git_commit(),
        std::env::consts::OS,
        std::env::consts::ARCH,
        if cfg!(feature = "bpf") { "yes" } else { "no" },
    )
}
