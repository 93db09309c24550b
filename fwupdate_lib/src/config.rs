//! The updater configuration record: everything a single [`crate::policy::update`]
//! call needs, constructed once from parsed CLI arguments, used for
//! exactly one update, then torn down.

use std::path::PathBuf;

use log::debug;

use crate::image::Image;
use crate::programmer::{EmulationProgrammer, Programmer, ProgrammerError};
use crate::quirks::Quirks;
use crate::sysprops::SysProps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// `--mode=autoupdate` / `-t`: the ordinary try-RW-first flow.
    AutoUpdate,
    /// `--mode=recovery`: same dispatch as autoupdate; recovery-specific
    /// image sourcing lives outside the core.
    Recovery,
    /// `--mode=legacy`: write `RW_LEGACY` only, bypassing key/TPM checks.
    Legacy,
    /// `--mode=factory` / `--factory`: requires WP disabled, full update,
    /// no try-next cookies.
    Factory,
    /// `--mode=factory_install`: same gating as Factory.
    FactoryInstall,
}

impl Default for UpdateMode {
    fn default() -> Self {
        UpdateMode::AutoUpdate
    }
}

/// Holds the target/current/EC/PD images, the property and quirk cells,
/// the temp-file list that's removed on drop, and the flags that steer
/// [`crate::policy::update`].
pub struct UpdaterConfig {
    pub target: Option<Image>,
    pub current: Option<Image>,
    pub ec_image: Option<Image>,
    pub pd_image: Option<Image>,

    pub sys_props: SysProps,
    pub quirks: Quirks,

    pub try_update: bool,
    pub force_update: bool,
    pub mode: UpdateMode,
    pub verbosity: u8,

    pub emulation_path: Option<PathBuf>,
    pub programmer_spec: Option<String>,

    /// Cached size of the programmer-readable current image, consulted
    /// by the `enlarge_image` quirk. Populated once the current image is
    /// loaded from the programmer.
    pub programmer_image_size: Option<usize>,

    /// Cached `platform_ver` read, consulted synchronously by quirks
    /// that don't otherwise have access to a programmer handle.
    pub platform_ver: i64,

    temp_files: Vec<PathBuf>,
}

impl UpdaterConfig {
    pub fn new() -> UpdaterConfig {
        UpdaterConfig {
            target: None,
            current: None,
            ec_image: None,
            pd_image: None,
            sys_props: SysProps::new(),
            quirks: Quirks::new(),
            try_update: false,
            force_update: false,
            mode: UpdateMode::default(),
            verbosity: 0,
            emulation_path: None,
            programmer_spec: None,
            programmer_image_size: None,
            platform_ver: -1,
            temp_files: Vec::new(),
        }
    }

    pub fn register_temp_file(&mut self, path: PathBuf) {
        debug!("registering temp file for cleanup: {path:?}");
        self.temp_files.push(path);
    }

    /// The active programmer backend. Only emulation mode is implemented
    /// in this crate (the real flash programmer is treated as an opaque
    /// external collaborator); a real build would dispatch here on
    /// `programmer_spec` to a `flashrom`-backed implementation instead.
    pub fn programmer(&self) -> Result<EmulationProgrammer, ProgrammerError> {
        match &self.emulation_path {
            Some(path) => Ok(EmulationProgrammer::new(path.clone())),
            None => Err(ProgrammerError::Read(
                "no emulation file configured; a real flashrom-backed programmer is outside this crate's scope".into(),
            )),
        }
    }

    pub fn load_current_from_programmer(&mut self) -> Result<(), ProgrammerError> {
        let programmer = self.programmer()?;
        let bytes = programmer.read_image()?;
        self.programmer_image_size = Some(bytes.len());
        let programmer_name = self.programmer_spec.clone().unwrap_or_else(|| "host".to_string());
        self.current = Some(Image::from_bytes(bytes, programmer_name, None));
        Ok(())
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove every registered temp file and drop the images: on any exit
/// path from the configuration lifetime, every temp file in the list is
/// removed.
impl Drop for UpdaterConfig {
    fn drop(&mut self) {
        for path in self.temp_files.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("failed to remove temp file {path:?}: {e}");
                }
            }
        }
    }
}
