use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Device security mode as configured on the CUCM line (drives both the
/// SIP transport and whether a CAPF exchange is needed at startup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    None,
    Authenticated,
    Encrypted,
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::None
    }
}

/// Everything the engine needs to know about the device it is acting as.
/// Immutable for the lifetime of a session. The host is responsible for
/// building this (from a file, env vars, a UI form, ...) and for holding
/// onto it across restarts -- this crate never persists it itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub cucm_host: String,
    #[serde(default = "default_sip_port")]
    pub sip_port: u16,
    #[serde(default = "default_sips_port")]
    pub sips_port: u16,
    pub line_number: String,
    pub display_name: String,
    pub device_name: String,
    pub contact_id: String,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub expected_cert_md5: Option<String>,
    #[serde(default)]
    pub capf_servers: Vec<CapfServer>,
}

fn default_sip_port() -> u16 {
    5060
}

fn default_sips_port() -> u16 {
    5061
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapfServer {
    pub host: String,
    #[serde(default = "default_capf_port")]
    pub port: u16,
}

fn default_capf_port() -> u16 {
    3804
}

/// Directories the engine reads/writes certificates and keys from.
#[derive(Debug, Clone)]
pub struct CertStore {
    pub client_cert_dir: PathBuf,
    pub server_cert_dir: PathBuf,
}

/// Top-level configuration for a [`crate::Phone`] instance.
#[derive(Debug, Clone)]
pub struct PhoneConfig {
    pub profile: DeviceProfile,
    pub certs: CertStore,
    /// Whether to verify the peer's TLS certificate hostname. The reference
    /// implementation disables this unconditionally; this engine defaults it
    /// on and leaves it as an explicit opt-out.
    pub verify_hostname: bool,
}

impl PhoneConfig {
    pub fn new(profile: DeviceProfile, certs: CertStore) -> Self {
        Self {
            profile,
            certs,
            verify_hostname: true,
        }
    }
}
