//! Version information reported by the listener.

/// Crate version from Cargo.toml
pub const EASEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub easel: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            easel: EASEL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        assert_eq!(VersionInfo::new().easel, EASEL_VERSION);
    }
}
