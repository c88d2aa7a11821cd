//! Build-info reporting for `--version`. Kept as its own module even though
//! it backs a single flag, the same separation `mqk-cli` gives its
//! `config-hash` status line.

pub struct BuildInfo {
    pub package_version: &'static str,
}

pub fn current() -> BuildInfo {
    BuildInfo {
        package_version: env!("CARGO_PKG_VERSION"),
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dmr {}", self.package_version)
    }
}
