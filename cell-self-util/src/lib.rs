//! Library behind the `cell-self-util` command line tool.
//!
//! This crate resolves everything a decryption run needs from the outside
//! world (key file, `dev_hdd0` directory, profile) and renders the header
//! dump shown by the `info` command.
//!
//! # Example
//!
//! ```no_run
//! use cell_self::Decrypter;
//! use cell_self_util::Config;
//!
//! let config = Config {
//!     keys: Some("keys.ini".into()),
//!     ..Config::default()
//! };
//!
//! let vault = config.load_vault().expect("failed to load keys");
//! let decrypter = Decrypter::new(&vault, config.licenses());
//! decrypter.decrypt_file("EBOOT.BIN", "EBOOT.elf").expect("decryption failed");
//! ```

pub mod info;

pub use self::info::write_info;

use cell_self::container::{self, SelfContainer};
use cell_self::keys::{self, KeyVault};
use cell_self::npdrm::RapDirectory;
use snafu::{ResultExt, Snafu};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Where keys and licenses come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Key file; `None` gives an empty vault that can only handle debug SELFs.
    pub keys: Option<PathBuf>,
    /// Root of the emulated `dev_hdd0` holding the `.rap` files.
    pub dev_hdd0: PathBuf,
    /// User profile whose `exdata` directory is searched.
    pub profile: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys: None,
            dev_hdd0: PathBuf::from("dev_hdd0"),
            profile: RapDirectory::DEFAULT_PROFILE.to_owned(),
        }
    }
}

impl Config {
    /// Builds the key vault from the configured key file.
    pub fn load_vault(&self) -> Result<KeyVault, ConfigError> {
        let Some(path) = &self.keys else {
            warn!("no key file given, only debug SELFs can be unwrapped");
            return Ok(KeyVault::default());
        };

        let vault = KeyVault::load(path).context(LoadKeysSnafu { path })?;

        info!(path = %path.display(), keysets = vault.len(), "key file loaded");

        Ok(vault)
    }

    /// Returns the license store for the configured profile.
    pub fn licenses(&self) -> RapDirectory {
        RapDirectory::new(&self.dev_hdd0).with_profile(&self.profile)
    }
}

/// Errors that can occur when resolving a [`Config`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to load key file '{}'", path.display()))]
    LoadKeys {
        path: PathBuf,
        source: keys::LoadError,
    },
}

/// Errors that can occur when opening a SELF file from disk.
#[derive(Debug, Snafu)]
pub enum OpenSelfError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to parse SELF headers"))]
    ParseSelf { source: container::LoadError },
}

/// Opens a SELF file and loads its headers without decrypting anything.
pub fn open_self(path: &Path) -> Result<SelfContainer, OpenSelfError> {
    let file = File::open(path).context(OpenFileSnafu)?;
    SelfContainer::load(&mut BufReader::new(file)).context(ParseSelfSnafu)
}

/// Returns where `decrypt` writes its output when none is given.
pub fn default_output(input: &Path) -> PathBuf {
    input.with_extension("elf")
}
