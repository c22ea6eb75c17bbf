//! Version information for peerline.

/// Peerline version from Cargo.toml
pub const PEERLINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the line format. Bumped only on wire-incompatible changes.
pub const PROTOCOL_REVISION: u32 = 1;

/// Version information reported to the other peer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub peerline: &'static str,
    pub protocol: u32,
    /// Name/version of the application embedding the peer (if set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            peerline: PEERLINE_VERSION,
            protocol: PROTOCOL_REVISION,
            application: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }
}
