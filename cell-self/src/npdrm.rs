//! NPDRM layer of the metadata info.
//!
//! Titles sold through the PlayStation Store wrap the metadata info in an
//! extra AES-128-CBC layer keyed by the title license (klicensee).

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

use crate::control::{ControlInfo, License};
use crate::crypto::{aes128_cbc_decrypt, aes128_ecb_decrypt};
use crate::keys::{NP_KLIC_FREE, NP_KLIC_KEY};
use crate::rap::rap_to_rif;

use unwrap_error::*;

/// Size of the metadata info block the NPDRM layer covers.
pub const METADATA_INFO_SIZE: usize = 0x40;

/// Source of `.rap` license keys.
pub trait LicenseStore {
    /// Returns the RAP key of `content_id`, or `None` if no license exists.
    fn find_rap(&self, content_id: &str) -> io::Result<Option<[u8; 16]>>;
}

impl<T: LicenseStore + ?Sized> LicenseStore for &T {
    fn find_rap(&self, content_id: &str) -> io::Result<Option<[u8; 16]>> {
        (**self).find_rap(content_id)
    }
}

/// A [`LicenseStore`] over the console layout
/// `<dev_hdd0>/home/<profile>/exdata/<content id>.rap`.
#[derive(Debug, Clone)]
pub struct RapDirectory {
    root: PathBuf,
    profile: String,
}

impl RapDirectory {
    pub const DEFAULT_PROFILE: &'static str = "00000001";

    /// Creates a store rooted at a `dev_hdd0` directory, using the default
    /// user profile.
    pub fn new(dev_hdd0: impl Into<PathBuf>) -> Self {
        Self {
            root: dev_hdd0.into(),
            profile: Self::DEFAULT_PROFILE.to_owned(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Returns where the license of `content_id` is expected.
    #[must_use]
    pub fn rap_path(&self, content_id: &str) -> PathBuf {
        self.root
            .join("home")
            .join(&self.profile)
            .join("exdata")
            .join(format!("{content_id}.rap"))
    }
}

impl LicenseStore for RapDirectory {
    fn find_rap(&self, content_id: &str) -> io::Result<Option<[u8; 16]>> {
        if !is_valid_content_id(content_id) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "content id is not a plain file name",
            ));
        }

        let path = self.rap_path(content_id);

        debug!(path = %path.display(), "looking for RAP file");

        let mut file = match File::open(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut rap = [0u8; 16];
        file.read_exact(&mut rap)?;

        Ok(Some(rap))
    }
}

/// Content ids look like `UP0001-NPUB00001_00-0000000000000001`.
fn is_valid_content_id(content_id: &str) -> bool {
    !content_id.is_empty()
        && content_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Removes the NPDRM layer from `metadata_info` in place.
///
/// Does nothing if `controls` has no NPDRM record.
pub fn unwrap_npdrm<L: LicenseStore + ?Sized>(
    metadata_info: &mut [u8; METADATA_INFO_SIZE],
    controls: &[ControlInfo],
    licenses: &L,
) -> Result<(), UnwrapError> {
    let Some(npdrm) = controls.iter().find_map(ControlInfo::npdrm) else {
        warn!("no NPDRM control info found");
        return Ok(());
    };

    let content_id = npdrm.content_id();

    info!(content_id, license = ?npdrm.license(), "removing NPDRM layer");

    let mut key = match npdrm.license() {
        License::Network => {
            return NetworkLicenseSnafu { content_id }.fail();
        }
        License::Local => {
            let rap = licenses
                .find_rap(content_id)
                .context(ReadRapFailedSnafu { content_id })?
                .context(MissingRapSnafu { content_id })?;

            rap_to_rif(&rap)
        }
        License::Free => NP_KLIC_FREE,
        License::Unknown(license) => return InvalidLicenseSnafu { license }.fail(),
    };

    aes128_ecb_decrypt(&NP_KLIC_KEY, &mut key);
    aes128_cbc_decrypt(&key, &[0u8; 16], metadata_info);

    Ok(())
}

/// Represents an error when [`unwrap_npdrm()`] fails.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum UnwrapError {
    #[snafu(display("{content_id} requires a network license"))]
    NetworkLicense { content_id: String },

    #[snafu(display("no RAP file for {content_id}"))]
    MissingRap { content_id: String },

    #[snafu(display("cannot read RAP file for {content_id}"))]
    ReadRapFailed {
        content_id: String,
        source: io::Error,
    },

    #[snafu(display("invalid NPDRM license type {license}"))]
    InvalidLicense { license: u32 },
}
