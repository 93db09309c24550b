//! Named, integer-valued policy modifiers that patch the image or alter
//! the update flow to accommodate device peculiarities.
//!
//! Each quirk is a cell of `{name, help, apply, value}`; `apply` is a
//! plain function pointer rather than a boxed closure -- there's a
//! closed set of five quirks and none of them need captured state beyond
//! the [`UpdaterConfig`](crate::config::UpdaterConfig) they're given.

use log::{info, warn};

use crate::cbfs;
use crate::config::UpdaterConfig;
use crate::error::{UpdateError, UpdateResult};

pub const ENLARGE_IMAGE: &str = "enlarge_image";
pub const MIN_PLATFORM_VERSION: &str = "min_platform_version";
pub const UNLOCK_ME_FOR_UPDATE: &str = "unlock_me_for_update";
pub const DAISY_SNOW_DUAL_MODEL: &str = "daisy_snow_dual_model";
pub const EVE_SMM_STORE: &str = "eve_smm_store";

pub const QUIRK_NAMES: [&str; 5] = [
    ENLARGE_IMAGE,
    MIN_PLATFORM_VERSION,
    UNLOCK_ME_FOR_UPDATE,
    DAISY_SNOW_DUAL_MODEL,
    EVE_SMM_STORE,
];

#[derive(Debug, Clone, Copy)]
pub struct Quirk {
    pub name: &'static str,
    pub help: &'static str,
    pub value: i64,
}

/// The five-quirk registry. `value` defaults to 0 (disabled) for every
/// quirk; a per-target default list is merged first, then the
/// user-supplied `--quirks` list, with later values always winning.
#[derive(Debug, Clone)]
pub struct Quirks {
    cells: [Quirk; 5],
}

impl Quirks {
    pub fn new() -> Quirks {
        Quirks {
            cells: [
                Quirk {
                    name: ENLARGE_IMAGE,
                    help: "pad the target image up to the flash size when it's smaller",
                    value: 0,
                },
                Quirk {
                    name: MIN_PLATFORM_VERSION,
                    help: "refuse to update below a given platform revision",
                    value: 0,
                },
                Quirk {
                    name: UNLOCK_ME_FOR_UPDATE,
                    help: "unlock the Management Engine region for the duration of the write",
                    value: 0,
                },
                Quirk {
                    name: DAISY_SNOW_DUAL_MODEL,
                    help: "reject updates on daisy/snow dual-model boards",
                    value: 0,
                },
                Quirk {
                    name: EVE_SMM_STORE,
                    help: "relocate the SMM store CBFS entry inside RW_LEGACY",
                    value: 0,
                },
            ],
        }
    }

    fn cell_mut(&mut self, name: &str) -> Option<&mut Quirk> {
        self.cells.iter_mut().find(|q| q.name == name)
    }

    pub fn value(&self, name: &str) -> i64 {
        self.cells.iter().find(|q| q.name == name).map(|q| q.value).unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, value: i64) -> Result<(), String> {
        match self.cell_mut(name) {
            Some(cell) => {
                cell.value = value;
                Ok(())
            }
            None => Err(format!("unknown quirk: {name}")),
        }
    }

    /// Parse a comma-or-space separated quirk list: `name` (value = 1) or
    /// `name=INT`. Unknown names are errors.
    pub fn apply_list(&mut self, list: &str) -> Result<(), String> {
        for item in list.split([',', ' ']).map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some((name, raw)) => {
                    let value: i64 = raw
                        .parse()
                        .map_err(|_| format!("invalid quirk value for {name}: {raw:?}"))?;
                    self.set(name, value)?;
                }
                None => self.set(item, 1)?,
            }
        }
        Ok(())
    }

    /// Per-target defaults derived from the target image itself: the
    /// only board-specific default is eve's SMM-store relocation, keyed
    /// off the target's RO platform prefix.
    pub fn defaults_for_target(ro_version: &str) -> Quirks {
        let mut quirks = Quirks::new();
        if ro_version.starts_with("Google.Eve.") {
            let _ = quirks.set(EVE_SMM_STORE, 1);
        }
        quirks
    }

    /// Run `name`'s `apply` action unless its value is 0.
    pub fn try_apply(&self, name: &str, cfg: &mut UpdaterConfig) -> UpdateResult<()> {
        let value = self.value(name);
        if value == 0 {
            return Ok(());
        }
        match name {
            ENLARGE_IMAGE => apply_enlarge_image(cfg),
            MIN_PLATFORM_VERSION => apply_min_platform_version(cfg, value),
            UNLOCK_ME_FOR_UPDATE => apply_unlock_me_for_update(cfg),
            DAISY_SNOW_DUAL_MODEL => apply_daisy_snow_dual_model(cfg),
            EVE_SMM_STORE => apply_eve_smm_store(cfg),
            _ => Ok(()),
        }
    }
}

impl Default for Quirks {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_enlarge_image(cfg: &mut UpdaterConfig) -> UpdateResult<()> {
    let flash_size = cfg
        .programmer_image_size
        .ok_or_else(|| UpdateError::SystemImage("cannot size the programmer for enlarge_image".into()))?;
    let target = cfg
        .target
        .as_mut()
        .ok_or_else(|| UpdateError::SystemImage("no target image to enlarge".into()))?;
    if flash_size <= target.bytes.len() {
        return Ok(());
    }
    let pad_byte = *target.bytes.last().unwrap_or(&0xFF);
    info!(
        "enlarge_image: padding target from {} to {} bytes with {:#04x}",
        target.bytes.len(),
        flash_size,
        pad_byte
    );
    target.bytes.resize(flash_size, pad_byte);
    target.reload_derived_state();
    Ok(())
}

fn apply_min_platform_version(cfg: &UpdaterConfig, min: i64) -> UpdateResult<()> {
    let current = cfg.platform_ver;
    if current < min {
        return Err(UpdateError::Platform(format!(
            "Need platform version >= {min} (current is {current})"
        )));
    }
    Ok(())
}

const SI_DESC_ME_UNLOCK_OFFSET: usize = 128;
const SI_DESC_ME_UNLOCK_BYTES: [u8; 12] = [0x00, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF];

fn apply_unlock_me_for_update(cfg: &mut UpdaterConfig) -> UpdateResult<()> {
    let target = cfg
        .target
        .as_mut()
        .ok_or_else(|| UpdateError::InvalidImage("no target image".into()))?;
    let section = target
        .section("SI_DESC")
        .ok_or_else(|| UpdateError::InvalidImage("target has no SI_DESC".into()))?;
    let start = section.offset + SI_DESC_ME_UNLOCK_OFFSET;
    let end = start + SI_DESC_ME_UNLOCK_BYTES.len();
    if end > section.end() || end > target.bytes.len() {
        return Err(UpdateError::InvalidImage("SI_DESC too small for ME unlock patch".into()));
    }
    target.bytes[start..end].copy_from_slice(&SI_DESC_ME_UNLOCK_BYTES);
    warn!("unlock_me_for_update: SI_DESC patched, ME unlocked for this write");
    Ok(())
}

fn apply_daisy_snow_dual_model(cfg: &UpdaterConfig) -> UpdateResult<()> {
    let Some(target) = cfg.target.as_ref() else {
        return Ok(());
    };
    let is_dual_model_board = target.ro_version.starts_with("Google.Daisy.") || target.ro_version.starts_with("Google.Snow.");
    if is_dual_model_board && cfg.platform_ver < 0 {
        return Err(UpdateError::Platform("daisy/snow dual-model board needs a readable platform version".into()));
    }
    Ok(())
}

fn apply_eve_smm_store(cfg: &mut UpdaterConfig) -> UpdateResult<()> {
    let target = cfg
        .target
        .as_mut()
        .ok_or_else(|| UpdateError::InvalidImage("no target image".into()))?;
    let legacy = target
        .section("RW_LEGACY")
        .ok_or_else(|| UpdateError::InvalidImage("target has no RW_LEGACY".into()))?;
    let smmstore = target.section("SMMSTORE");

    let region = legacy.slice_mut(&mut target.bytes);
    cbfs::relocate_smm_store(region, smmstore.map(|s| s.len()))
        .map_err(|e| UpdateError::InvalidImage(format!("eve_smm_store: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parses_bare_and_valued_items() {
        let mut q = Quirks::new();
        q.apply_list("enlarge_image, min_platform_version=3").unwrap();
        assert_eq!(q.value(ENLARGE_IMAGE), 1);
        assert_eq!(q.value(MIN_PLATFORM_VERSION), 3);
    }

    #[test]
    fn unknown_name_is_error() {
        let mut q = Quirks::new();
        assert!(q.apply_list("not_a_real_quirk").is_err());
    }

    #[test]
    fn default_then_user_list_user_wins() {
        let mut q = Quirks::defaults_for_target("Google.Eve.12345");
        assert_eq!(q.value(EVE_SMM_STORE), 1);
        q.apply_list("eve_smm_store=0").unwrap();
        assert_eq!(q.value(EVE_SMM_STORE), 0);
    }

    #[test]
    fn min_platform_version_rejects_below_floor() {
        let mut cfg = UpdaterConfig::new();
        cfg.platform_ver = 2;
        let err = apply_min_platform_version(&cfg, 3).unwrap_err();
        assert_eq!(err.to_string(), "platform is not compatible: Need platform version >= 3 (current is 2)");
    }
}
