//! Backend configuration
//!
//! Defaults match the telephony service's agent contract. Tests point these
//! at a private bus.

use serde::{Deserialize, Serialize};

/// Narrowband codec id (8 kHz)
pub const CODEC_CVSD: u8 = 0x01;
/// Wideband codec id (16 kHz); not advertised yet
pub const CODEC_MSBC: u8 = 0x02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Well-known name of the telephony manager service
    pub service: String,
    /// Manager interface providing Register/Unregister
    pub manager_interface: String,
    /// Object path the manager lives at
    pub manager_path: String,
    /// Path our agent object is served at
    pub agent_path: String,
    /// Codec ids advertised in Register, in preference order
    pub codecs: Vec<u8>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            service: "org.ofono".to_string(),
            manager_interface: "org.ofono.HandsfreeAudioManager".to_string(),
            manager_path: "/".to_string(),
            agent_path: "/HandsfreeAudioAgent".to_string(),
            codecs: vec![CODEC_CVSD],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_advertises_narrowband_only() {
        let config = BackendConfig::default();
        assert_eq!(config.codecs, vec![CODEC_CVSD]);
        assert_eq!(config.agent_path, "/HandsfreeAudioAgent");
        assert_eq!(config.service, "org.ofono");
    }
}
