//! Signal envelope codec.
//!
//! Session descriptions are exchanged out of band as prefixed strings:
//!
//!   SHR0:<base64url>          raw JSON
//!   SHR1:<base64url>          gzip JSON
//!   SHR2:<base32>             gzip JSON
//!   SHR3:<base32>             raw JSON
//!
//! The body encodes `{"t": "offer"|"answer", "s": <description>,
//! "c": {"stun": 0|1, "fileUnordered": 0|1, "fast": 0|1}}`. The encoder
//! emits base32 (`SHR2:` when compression is enabled, `SHR3:` otherwise);
//! decoders accept all four prefixes. Base32 decoding is case-insensitive
//! and tolerates embedded whitespace so codes survive manual copying.

pub mod sdp;

use crate::core::error::{EngineError, Result};
use crate::core::settings::EngineConfig;
use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const PREFIX_RAW_B64: &str = "SHR0:";
const PREFIX_GZ_B64: &str = "SHR1:";
const PREFIX_GZ_B32: &str = "SHR2:";
const PREFIX_RAW_B32: &str = "SHR3:";

// ── Envelope types ───────────────────────────────────────────────────────────

/// Whether a signal carries an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
}

impl SignalKind {
    fn as_wire(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
        }
    }

    fn from_wire(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            other => Err(EngineError::InvalidFormat(format!(
                "unknown signal kind '{other}'"
            ))),
        }
    }
}

/// Option flags carried alongside the description so both sides agree on
/// channel ordering and pacing before the control channel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlags {
    pub stun: bool,
    pub file_unordered: bool,
    pub fast: bool,
}

impl SignalFlags {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            stun: cfg.use_stun,
            file_unordered: cfg.use_unordered_file_channels,
            fast: cfg.fast_mode,
        }
    }
}

/// A fully decoded signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSignal {
    pub kind: SignalKind,
    pub description: String,
    pub flags: SignalFlags,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    t: String,
    s: String,
    c: WireFlags,
}

#[derive(Serialize, Deserialize)]
struct WireFlags {
    stun: u8,
    #[serde(rename = "fileUnordered")]
    file_unordered: u8,
    fast: u8,
}

// ── Encode / decode ──────────────────────────────────────────────────────────

/// Encode a session description into a prefixed signal string.
pub fn encode(kind: SignalKind, description: &str, cfg: &EngineConfig) -> Result<String> {
    let flags = SignalFlags::from_config(cfg);
    let envelope = WireEnvelope {
        t: kind.as_wire().to_string(),
        s: description.to_string(),
        c: WireFlags {
            stun: flags.stun as u8,
            file_unordered: flags.file_unordered as u8,
            fast: flags.fast as u8,
        },
    };
    let json = serde_json::to_vec(&envelope)
        .map_err(|e| EngineError::InvalidFormat(format!("envelope serialization: {e}")))?;

    if cfg.use_compression {
        let packed = gzip(&json)?;
        Ok(format!("{PREFIX_GZ_B32}{}", BASE32_NOPAD.encode(&packed)))
    } else {
        Ok(format!("{PREFIX_RAW_B32}{}", BASE32_NOPAD.encode(&json)))
    }
}

/// Decode any of the four prefixed forms back into `(kind, description, flags)`.
pub fn decode(signal: &str) -> Result<DecodedSignal> {
    let signal = signal.trim();
    let (body, base32, compressed) = if let Some(rest) = signal.strip_prefix(PREFIX_GZ_B32) {
        (rest, true, true)
    } else if let Some(rest) = signal.strip_prefix(PREFIX_RAW_B32) {
        (rest, true, false)
    } else if let Some(rest) = signal.strip_prefix(PREFIX_GZ_B64) {
        (rest, false, true)
    } else if let Some(rest) = signal.strip_prefix(PREFIX_RAW_B64) {
        (rest, false, false)
    } else {
        return Err(EngineError::InvalidFormat("unknown signal prefix".into()));
    };

    let bytes = if base32 {
        // Case-insensitive, whitespace-tolerant base32.
        let normalized: String = body
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| EngineError::InvalidFormat(format!("base32 body: {e}")))?
    } else {
        let normalized: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64URL_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| EngineError::InvalidFormat(format!("base64url body: {e}")))?
    };

    let json = if compressed { gunzip(&bytes)? } else { bytes };

    let envelope: WireEnvelope = serde_json::from_slice(&json)
        .map_err(|e| EngineError::InvalidFormat(format!("envelope JSON: {e}")))?;

    Ok(DecodedSignal {
        kind: SignalKind::from_wire(&envelope.t)?,
        description: envelope.s,
        flags: SignalFlags {
            stun: envelope.c.stun != 0,
            file_unordered: envelope.c.file_unordered != 0,
            fast: envelope.c.fast != 0,
        },
    })
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| EngineError::InvalidFormat(format!("gzip: {e}")))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::InvalidFormat(format!("gunzip: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(compress: bool) -> EngineConfig {
        EngineConfig {
            use_compression: compress,
            ..EngineConfig::default()
        }
    }

    const SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n";

    #[test]
    fn compressed_emission_roundtrips() {
        let encoded = encode(SignalKind::Offer, SDP, &cfg(true)).unwrap();
        assert!(encoded.starts_with("SHR2:"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.kind, SignalKind::Offer);
        assert_eq!(decoded.description, SDP);
        assert!(decoded.flags.stun);
        assert!(!decoded.flags.fast);
    }

    #[test]
    fn raw_emission_roundtrips() {
        let encoded = encode(SignalKind::Answer, SDP, &cfg(false)).unwrap();
        assert!(encoded.starts_with("SHR3:"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.kind, SignalKind::Answer);
        assert_eq!(decoded.description, SDP);
    }

    #[test]
    fn all_four_prefixes_decode() {
        let envelope =
            r#"{"t":"offer","s":"desc","c":{"stun":1,"fileUnordered":1,"fast":0}}"#.as_bytes();
        let packed = gzip(envelope).unwrap();

        let forms = [
            format!("SHR0:{}", BASE64URL_NOPAD.encode(envelope)),
            format!("SHR1:{}", BASE64URL_NOPAD.encode(&packed)),
            format!("SHR2:{}", BASE32_NOPAD.encode(&packed)),
            format!("SHR3:{}", BASE32_NOPAD.encode(envelope)),
        ];
        for form in forms {
            let decoded = decode(&form).unwrap();
            assert_eq!(decoded.description, "desc");
            assert!(decoded.flags.file_unordered);
        }
    }

    #[test]
    fn base32_decode_is_case_insensitive_and_skips_whitespace() {
        let encoded = encode(SignalKind::Offer, SDP, &cfg(true)).unwrap();
        let body = encoded.strip_prefix("SHR2:").unwrap();
        let mangled: String = body
            .to_ascii_lowercase()
            .chars()
            .enumerate()
            .flat_map(|(i, c)| {
                if i % 7 == 0 {
                    vec![' ', c]
                } else {
                    vec![c]
                }
            })
            .collect();
        let decoded = decode(&format!("SHR2:{mangled}")).unwrap();
        assert_eq!(decoded.description, SDP);
    }

    #[test]
    fn flags_survive_any_configuration() {
        for stun in [false, true] {
            for unordered in [false, true] {
                for fast in [false, true] {
                    for compress in [false, true] {
                        let config = EngineConfig {
                            use_stun: stun,
                            use_compression: compress,
                            use_unordered_file_channels: unordered,
                            fast_mode: fast,
                            ..EngineConfig::default()
                        };
                        let decoded =
                            decode(&encode(SignalKind::Offer, SDP, &config).unwrap()).unwrap();
                        assert_eq!(decoded.flags.stun, stun);
                        assert_eq!(decoded.flags.file_unordered, unordered);
                        assert_eq!(decoded.flags.fast, fast);
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_prefix_and_garbage_are_invalid_format() {
        for bad in ["XYZ:abc", "SHR9:abc", "", "SHR2:!!!not-base32!!!"] {
            assert!(matches!(decode(bad), Err(EngineError::InvalidFormat(_))));
        }
        // Valid base32 wrapping a non-gzip body.
        let bogus = format!("SHR2:{}", BASE32_NOPAD.encode(b"plainly not gzip"));
        assert!(matches!(decode(&bogus), Err(EngineError::InvalidFormat(_))));
    }

    #[test]
    fn unknown_signal_kind_rejected() {
        let envelope = r#"{"t":"renegotiate","s":"x","c":{"stun":0,"fileUnordered":0,"fast":0}}"#;
        let form = format!("SHR3:{}", BASE32_NOPAD.encode(envelope.as_bytes()));
        assert!(matches!(decode(&form), Err(EngineError::InvalidFormat(_))));
    }
}
