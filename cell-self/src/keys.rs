//! Key material for SELF decryption.
//!
//! A [`KeyVault`] holds the per-firmware keysets (ERK/RIV pairs) used to
//! decrypt the metadata info of a SELF, plus the fixed NPDRM keys. The vault
//! is immutable once built; build it once at startup and share it by
//! reference between decryption runs.
//!
//! # Key file format
//!
//! Keysets can be loaded from an INI-like text file, one section per
//! keyset:
//!
//! ```text
//! ; comments start with ';' or '#'
//! [npdrm_0x0A]
//! type = NPDRM
//! revision = 000A
//! version = 0003003000000000
//! erk = <64 hex digits>
//! riv = <32 hex digits>
//! ```
//!
//! A section named `default` is used when no other entry matches.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

/// Free license klicensee (`NP_KLIC_FREE`).
pub const NP_KLIC_FREE: [u8; 16] = [
    0x72, 0xF9, 0x90, 0x78, 0x8F, 0x9C, 0xFF, 0x74, 0x57, 0x25, 0xF0, 0x8E, 0x4C, 0x12, 0x83, 0x87,
];

/// Key used to unwrap a klicensee into the NPDRM key (`NP_KLIC_KEY`).
pub const NP_KLIC_KEY: [u8; 16] = [
    0xF2, 0xFB, 0xCA, 0x7A, 0x75, 0xB0, 0x4E, 0xDC, 0x13, 0x90, 0x63, 0x8C, 0xCD, 0xFD, 0xD1, 0xEE,
];

/// Program category a SELF belongs to, taken from its application info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelfType {
    Lv0,
    Lv1,
    Lv2,
    App,
    Iso,
    Ldr,
    Unk7,
    Npdrm,
    /// Unrecognized type.
    Unknown(u32),
}

impl SelfType {
    /// Converts the raw application info value into a [`SelfType`].
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::Lv0,
            2 => Self::Lv1,
            3 => Self::Lv2,
            4 => Self::App,
            5 => Self::Iso,
            6 => Self::Ldr,
            7 => Self::Unk7,
            8 => Self::Npdrm,
            other => Self::Unknown(other),
        }
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Lv0 => 1,
            Self::Lv1 => 2,
            Self::Lv2 => 3,
            Self::App => 4,
            Self::Iso => 5,
            Self::Ldr => 6,
            Self::Unk7 => 7,
            Self::Npdrm => 8,
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns the name used in key files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lv0 => "LV0",
            Self::Lv1 => "LV1",
            Self::Lv2 => "LV2",
            Self::App => "APP",
            Self::Iso => "ISO",
            Self::Ldr => "LDR",
            Self::Unk7 => "UNK7",
            Self::Npdrm => "NPDRM",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for SelfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN (0x{raw:X})"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for SelfType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "LV0" => Self::Lv0,
            "LV1" => Self::Lv1,
            "LV2" => Self::Lv2,
            "APP" => Self::App,
            "ISO" => Self::Iso,
            "LDR" => Self::Ldr,
            "UNK7" => Self::Unk7,
            "NPDRM" => Self::Npdrm,
            _ => return Err(()),
        })
    }
}

/// A keyset able to decrypt the metadata info of matching SELFs.
#[derive(Clone, PartialEq, Eq)]
pub struct SelfKey {
    pub self_type: SelfType,
    /// Key revision from the SCE header.
    pub revision: u16,
    /// Firmware version from the application info.
    pub version: u64,
    /// Encryption root key (AES-256).
    pub erk: [u8; 32],
    /// Root IV.
    pub riv: [u8; 16],
}

impl fmt::Debug for SelfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfKey")
            .field("self_type", &self.self_type)
            .field("revision", &format_args!("0x{:04X}", self.revision))
            .field("version", &format_args!("0x{:016X}", self.version))
            .finish_non_exhaustive()
    }
}

/// Errors when looking up a keyset.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LookupError {
    #[snafu(display(
        "no keyset for {self_type} SELF (revision 0x{revision:04X}, version 0x{version:016X})"
    ))]
    UnknownKeyset {
        self_type: SelfType,
        revision: u16,
        version: u64,
    },
}

/// Errors when loading a key file.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("cannot open key file"))]
    OpenFailed { source: std::io::Error },

    #[snafu(display("cannot read line {line}"))]
    ReadFailed { line: usize, source: std::io::Error },

    #[snafu(display("line {line}: expected `[name]` or `field = value`"))]
    InvalidLine { line: usize },

    #[snafu(display("line {line}: field outside of a keyset section"))]
    NoSection { line: usize },

    #[snafu(display("line {line}: invalid value for `{field}`"))]
    InvalidValue { line: usize, field: &'static str },

    #[snafu(display("keyset [{section}] has no `{field}`"))]
    MissingField {
        section: String,
        field: &'static str,
    },
}

/// Immutable table of SELF keysets.
#[derive(Debug, Default, Clone)]
pub struct KeyVault {
    keys: Vec<SelfKey>,
    default: Option<SelfKey>,
}

impl KeyVault {
    /// Creates a vault from a list of keysets.
    pub fn new(keys: Vec<SelfKey>) -> Self {
        Self {
            keys,
            default: None,
        }
    }

    /// Sets the keyset returned when nothing else matches.
    pub fn with_default(mut self, key: SelfKey) -> Self {
        self.default = Some(key);
        self
    }

    /// Loads a vault from a key file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let file = std::fs::File::open(path).context(load_error::OpenFailedSnafu)?;
        Self::parse(file)
    }

    /// Parses a vault from any reader in key file format.
    pub fn parse<R: Read>(reader: R) -> Result<Self, LoadError> {
        let mut keys = Vec::new();
        let mut default = None;
        let mut current: Option<PendingKey> = None;

        for (num, line) in BufReader::new(reader).lines().enumerate() {
            let line_no = num + 1;
            let line = line.context(load_error::ReadFailedSnafu { line: line_no })?;
            let line = line.trim();

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
                if let Some(pending) = current.take() {
                    pending.finish(&mut keys, &mut default)?;
                }

                current = Some(PendingKey::new(name.trim()));
                continue;
            }

            let (name, value) = line
                .split_once('=')
                .context(load_error::InvalidLineSnafu { line: line_no })?;
            let pending = current
                .as_mut()
                .context(load_error::NoSectionSnafu { line: line_no })?;

            pending.set(name.trim(), value.trim(), line_no)?;
        }

        if let Some(pending) = current {
            pending.finish(&mut keys, &mut default)?;
        }

        debug!(count = keys.len(), has_default = default.is_some(), "loaded SELF keysets");

        Ok(Self { keys, default })
    }

    /// Returns the number of keysets, excluding the default one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the vault holds no keyset at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.default.is_none()
    }

    /// Finds the keyset for a SELF.
    ///
    /// `revision` is the SCE header key revision and `version` the
    /// application info firmware version.
    pub fn lookup(
        &self,
        self_type: SelfType,
        revision: u16,
        version: u64,
    ) -> Result<&SelfKey, LookupError> {
        debug!(%self_type, revision, version, "looking up SELF keyset");

        let mut candidates = self.keys.iter().filter(|k| k.self_type == self_type);

        let found = match self_type {
            SelfType::Lv0 | SelfType::Ldr => candidates.next(),
            SelfType::Lv1 | SelfType::Lv2 | SelfType::Unk7 => {
                candidates.find(|k| k.version == version)
            }
            SelfType::App | SelfType::Npdrm => candidates.find(|k| k.revision == revision),
            SelfType::Iso => candidates.find(|k| k.revision == revision && k.version == version),
            SelfType::Unknown(_) => None,
        };

        found
            .or(self.default.as_ref())
            .context(UnknownKeysetSnafu {
                self_type,
                revision,
                version,
            })
    }

    /// Returns the klicensee used by free-license NPDRM titles.
    #[must_use]
    pub const fn free_license_key(&self) -> &'static [u8; 16] {
        &NP_KLIC_FREE
    }

    /// Returns the key that unwraps a klicensee into the NPDRM key.
    #[must_use]
    pub const fn drm_unwrap_key(&self) -> &'static [u8; 16] {
        &NP_KLIC_KEY
    }
}

/// A keyset section being parsed.
struct PendingKey {
    name: String,
    self_type: Option<SelfType>,
    revision: u16,
    version: u64,
    erk: Option<[u8; 32]>,
    riv: Option<[u8; 16]>,
}

impl PendingKey {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            self_type: None,
            revision: 0,
            version: 0,
            erk: None,
            riv: None,
        }
    }

    fn set(&mut self, name: &str, value: &str, line: usize) -> Result<(), LoadError> {
        match name.to_ascii_lowercase().as_str() {
            "type" => {
                let v = value.parse().ok();
                self.self_type = Some(v.context(load_error::InvalidValueSnafu {
                    line,
                    field: "type",
                })?);
            }
            "revision" => {
                self.revision = u16::from_str_radix(strip_hex_prefix(value), 16)
                    .ok()
                    .context(load_error::InvalidValueSnafu {
                        line,
                        field: "revision",
                    })?;
            }
            "version" => {
                self.version = u64::from_str_radix(strip_hex_prefix(value), 16)
                    .ok()
                    .context(load_error::InvalidValueSnafu {
                        line,
                        field: "version",
                    })?;
            }
            "erk" => {
                let mut erk = [0u8; 32];
                hex::decode_to_slice(value, &mut erk)
                    .ok()
                    .context(load_error::InvalidValueSnafu { line, field: "erk" })?;
                self.erk = Some(erk);
            }
            "riv" => {
                let mut riv = [0u8; 16];
                hex::decode_to_slice(value, &mut riv)
                    .ok()
                    .context(load_error::InvalidValueSnafu { line, field: "riv" })?;
                self.riv = Some(riv);
            }
            // Signature material and curve indices are not needed to decrypt.
            _ => {}
        }

        Ok(())
    }

    fn finish(self, keys: &mut Vec<SelfKey>, default: &mut Option<SelfKey>) -> Result<(), LoadError> {
        let is_default = self.name.eq_ignore_ascii_case("default");

        let self_type = match (self.self_type, is_default) {
            (Some(v), _) => v,
            (None, true) => SelfType::Unknown(0),
            (None, false) => {
                return Err(LoadError::MissingField {
                    section: self.name,
                    field: "type",
                });
            }
        };

        let Some(erk) = self.erk else {
            return Err(LoadError::MissingField {
                section: self.name,
                field: "erk",
            });
        };

        let Some(riv) = self.riv else {
            return Err(LoadError::MissingField {
                section: self.name,
                field: "riv",
            });
        };

        let key = SelfKey {
            self_type,
            revision: self.revision,
            version: self.version,
            erk,
            riv,
        };

        if is_default {
            *default = Some(key);
        } else {
            keys.push(key);
        }

        Ok(())
    }
}

fn strip_hex_prefix(v: &str) -> &str {
    v.strip_prefix("0x")
        .or_else(|| v.strip_prefix("0X"))
        .unwrap_or(v)
}
