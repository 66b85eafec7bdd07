//! Session configuration and persisted preferences.
//!
//! [`EngineConfig`] is the immutable per-session record every component
//! receives at construction; nothing in the engine reads configuration
//! from globals. [`Preferences`] is the on-disk surface it is loaded
//! from, stored as JSON under the platform config directory with a
//! write-temp-then-rename so a mid-write crash cannot corrupt it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, warn};

// ── Session configuration ────────────────────────────────────────────────────

/// TURN relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
    /// Restrict ICE to relayed candidates only.
    pub force_relay: bool,
}

/// Immutable per-session configuration, snapshotted into the peer session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Gather server-reflexive candidates via STUN.
    pub use_stun: bool,
    /// Gzip signal envelopes before encoding.
    pub use_compression: bool,
    /// Open file channels unordered; chunks are resequenced by seq.
    pub use_unordered_file_channels: bool,
    /// Stripe file sends across parallel channels when the remote
    /// advertises support.
    pub use_striping: bool,
    /// Larger pacing budgets and write batches.
    pub fast_mode: bool,
    /// Rewrite `.local` host candidates to this LAN address.
    pub lan_host_override: Option<Ipv4Addr>,
    pub turn: Option<TurnConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_stun: true,
            use_compression: true,
            use_unordered_file_channels: false,
            use_striping: true,
            fast_mode: false,
            lan_host_override: None,
            turn: None,
        }
    }
}

// ── Persisted preferences ────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// The persisted preference surface. Field names are the stable storage
/// keys; missing keys fall back to defaults so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(rename = "use_stun", default = "default_true")]
    pub use_stun: bool,
    #[serde(rename = "signal_compress", default = "default_true")]
    pub signal_compress: bool,
    #[serde(rename = "file_unordered", default)]
    pub file_unordered: bool,
    #[serde(rename = "transfer_fast", default)]
    pub transfer_fast: bool,
    #[serde(rename = "lan_ip_override", default)]
    pub lan_ip_override: bool,
    #[serde(rename = "lan_ip_value", default)]
    pub lan_ip_value: String,
    #[serde(rename = "turn_enabled", default)]
    pub turn_enabled: bool,
    #[serde(rename = "turn_url", default)]
    pub turn_url: String,
    #[serde(rename = "turn_username", default)]
    pub turn_username: String,
    #[serde(rename = "turn_credential", default)]
    pub turn_credential: String,
    #[serde(rename = "turn_force_relay", default)]
    pub turn_force_relay: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            use_stun: true,
            signal_compress: true,
            file_unordered: false,
            transfer_fast: false,
            lan_ip_override: false,
            lan_ip_value: String::new(),
            turn_enabled: false,
            turn_url: String::new(),
            turn_username: String::new(),
            turn_credential: String::new(),
            turn_force_relay: false,
        }
    }
}

impl Preferences {
    /// Default preferences file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sharefile")
            .join("preferences.json")
    }

    /// Load preferences, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(prefs) => prefs,
                Err(e) => {
                    warn!(
                        event = "preferences_parse_failure",
                        path = %path.display(),
                        error = %e,
                        "Ignoring corrupt preferences file"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist preferences atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(path, &json)
    }

    /// Resolve the persisted surface into a session configuration.
    ///
    /// An invalid LAN override value is dropped rather than failing the
    /// whole session; striping has no persisted switch and stays on.
    pub fn to_engine_config(&self) -> EngineConfig {
        let lan_host_override = if self.lan_ip_override {
            match Ipv4Addr::from_str(self.lan_ip_value.trim()) {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(
                        event = "lan_override_invalid",
                        value = %self.lan_ip_value,
                        "Ignoring invalid LAN IP override"
                    );
                    None
                }
            }
        } else {
            None
        };

        let turn = if self.turn_enabled && !self.turn_url.trim().is_empty() {
            Some(TurnConfig {
                url: self.turn_url.trim().to_string(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
                force_relay: self.turn_force_relay,
            })
        } else {
            None
        };

        EngineConfig {
            use_stun: self.use_stun,
            use_compression: self.signal_compress,
            use_unordered_file_channels: self.file_unordered,
            use_striping: true,
            fast_mode: self.transfer_fast,
            lan_host_override,
            turn,
        }
    }
}

// ── Atomic write ─────────────────────────────────────────────────────────────

/// Atomically write `content` to `path` via a temporary file and rename.
/// `rename()` is atomic on all major filesystems when source and
/// destination share a mount.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "preferences_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to replace preferences file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        anyhow::Error::from(e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_disk() {
        let dir = std::env::temp_dir().join(format!("sharefile-prefs-{}", std::process::id()));
        let path = dir.join("preferences.json");

        let mut prefs = Preferences::default();
        prefs.file_unordered = true;
        prefs.lan_ip_override = true;
        prefs.lan_ip_value = "192.168.1.7".into();
        prefs.save(&path).unwrap();

        let loaded = Preferences::load(&path);
        assert!(loaded.file_unordered);
        assert_eq!(loaded.lan_ip_value, "192.168.1.7");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn storage_keys_are_stable() {
        let json = serde_json::to_value(Preferences::default()).unwrap();
        for key in [
            "use_stun",
            "signal_compress",
            "file_unordered",
            "transfer_fast",
            "lan_ip_override",
            "lan_ip_value",
            "turn_enabled",
            "turn_url",
            "turn_username",
            "turn_credential",
            "turn_force_relay",
        ] {
            assert!(json.get(key).is_some(), "missing storage key {key}");
        }
    }

    #[test]
    fn invalid_lan_override_is_dropped() {
        let mut prefs = Preferences::default();
        prefs.lan_ip_override = true;
        prefs.lan_ip_value = "999.1.2.3".into();
        assert_eq!(prefs.to_engine_config().lan_host_override, None);

        prefs.lan_ip_value = "10.0.0.2".into();
        assert_eq!(
            prefs.to_engine_config().lan_host_override,
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn turn_requires_url() {
        let mut prefs = Preferences::default();
        prefs.turn_enabled = true;
        assert!(prefs.to_engine_config().turn.is_none());

        prefs.turn_url = "turn:relay.example.org:3478".into();
        prefs.turn_force_relay = true;
        let turn = prefs.to_engine_config().turn.unwrap();
        assert_eq!(turn.url, "turn:relay.example.org:3478");
        assert!(turn.force_relay);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("sharefile-prefs-bad-{}", std::process::id()));
        let path = dir.join("preferences.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let loaded = Preferences::load(&path);
        assert!(loaded.use_stun);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
