//! An owned firmware image buffer plus the metadata the rest of the engine
//! needs to reason about it: where it came from, its FMAP, and its three
//! version strings.

use std::fs;
use std::path::Path;

use log::debug;

use crate::fmap::{FmapView, Section};
use crate::vboot;

/// An owned byte buffer for one firmware image (target, current, EC, or
/// PD), plus everything derived from parsing it once.
#[derive(Debug, Clone)]
pub struct Image {
    pub bytes: Vec<u8>,
    /// Opaque string naming the backing flash programmer, e.g.
    /// `"host"` or `"ec"`. Not interpreted by this module.
    pub programmer: String,
    pub source_file: Option<String>,
    pub fmap: Option<FmapView>,
    pub ro_version: String,
    pub rw_version_a: String,
    pub rw_version_b: String,
}

impl Image {
    pub fn from_bytes(bytes: Vec<u8>, programmer: impl Into<String>, source_file: Option<String>) -> Image {
        let fmap = FmapView::parse(&bytes);
        let (ro_version, rw_version_a, rw_version_b) = match &fmap {
            Some(fmap) => (
                vboot::load_firmware_version(&bytes, fmap, "RO_FRID").unwrap_or_default(),
                vboot::load_firmware_version(&bytes, fmap, "RW_FWID_A")
                    .or_else(|| vboot::load_firmware_version(&bytes, fmap, "RW_FWID"))
                    .unwrap_or_default(),
                vboot::load_firmware_version(&bytes, fmap, "RW_FWID_B")
                    .or_else(|| vboot::load_firmware_version(&bytes, fmap, "RW_FWID"))
                    .unwrap_or_default(),
            ),
            None => {
                debug!("image has no FMAP; version strings left empty");
                (String::new(), String::new(), String::new())
            }
        };

        Image {
            bytes,
            programmer: programmer.into(),
            source_file,
            fmap,
            ro_version,
            rw_version_a,
            rw_version_b,
        }
    }

    pub fn load_from_file(path: &Path, programmer: impl Into<String>) -> std::io::Result<Image> {
        let bytes = fs::read(path)?;
        Ok(Image::from_bytes(
            bytes,
            programmer,
            Some(path.display().to_string()),
        ))
    }

    pub fn section(&self, name: &str) -> Option<Section> {
        self.fmap.as_ref()?.find(name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.fmap.as_ref().map(|f| f.exists(name)).unwrap_or(false)
    }

    pub fn section_bytes(&self, name: &str) -> Option<&[u8]> {
        let section = self.section(name)?;
        if !section.fits_within(self.bytes.len()) {
            return None;
        }
        Some(section.slice(&self.bytes))
    }

    pub fn section_bytes_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let section = self.section(name)?;
        if !section.fits_within(self.bytes.len()) {
            return None;
        }
        Some(section.slice_mut(&mut self.bytes))
    }

    /// Reparse the FMAP and version strings after the buffer has been
    /// resized (e.g. by the `enlarge_image` quirk). Section views derived
    /// before this call are no longer valid.
    pub fn reload_derived_state(&mut self) {
        *self = Image::from_bytes(
            std::mem::take(&mut self.bytes),
            std::mem::take(&mut self.programmer),
            self.source_file.take(),
        );
    }
}

/// All recognized, bit-exact section names, including the legacy
/// `"RO_FSG"` alias that's only present on some boards.
pub const RECOGNIZED_SECTIONS: &[&str] = &[
    "RO_FRID",
    "RO_SECTION",
    "GBB",
    "RO_PRESERVE",
    "RO_VPD",
    "RW_VPD",
    "VBLOCK_A",
    "VBLOCK_B",
    "RW_SECTION_A",
    "RW_SECTION_B",
    "RW_FWID",
    "RW_FWID_A",
    "RW_FWID_B",
    "RW_SHARED",
    "RW_NVRAM",
    "RW_ELOG",
    "RW_PRESERVE",
    "RW_LEGACY",
    "SMMSTORE",
    "SI_DESC",
    "SI_ME",
    "RO_FSG",
];
