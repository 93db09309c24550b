//! The flash-backend facade: read/write a whole image or a named section,
//! and report write-protect status, through an opaque "programmer"
//! identifier.
//!
//! A real implementation shells out to `flashrom`, reads `mosys` for
//! platform revision, and the vboot host tools for `mainfw_act`/`tpm_fwver`/
//! `fw_vboot2`. That's exactly the kind of blocking, stringly-typed
//! external collaborator the core should never depend on directly; what
//! the core needs is the trait below. [`EmulationProgrammer`] is the one
//! concrete implementation this crate carries itself, because emulation
//! mode is part of the testable contract.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::fmap::FmapView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgrammerError {
    Read(String),
    Write(String),
}

impl std::fmt::Display for ProgrammerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgrammerError::Read(s) => write!(f, "programmer read failed: {s}"),
            ProgrammerError::Write(s) => write!(f, "programmer write failed: {s}"),
        }
    }
}
impl std::error::Error for ProgrammerError {}

/// The flash backend contract the policy layer (§4.G) consumes. A write
/// with `section = None` replaces the whole image; a write naming a
/// section replaces exactly that FMAP range.
pub trait Programmer {
    /// Read the whole current image from the backing store.
    fn read_image(&self) -> Result<Vec<u8>, ProgrammerError>;

    /// Write `bytes` to the backing store. `section` names a replacement
    /// range; `None` replaces the whole image.
    fn write(&self, bytes: &[u8], section: Option<&str>) -> Result<(), ProgrammerError>;

    /// `true` if hardware write protect is engaged, `None` if it could
    /// not be determined.
    fn wp_hw_status(&self) -> Option<bool>;
    fn wp_sw_status(&self) -> Option<bool>;

    fn mainfw_act(&self) -> Option<String>;
    fn tpm_fwver(&self) -> Option<i64>;
    fn fw_vboot2(&self) -> Option<bool>;
    fn platform_revision(&self) -> Option<String>;

    /// Set the vboot try-next cookies (`fw_try_next`, `fw_try_count`).
    /// `next_slot` is `None` on vboot1 boards, which have no `fw_try_next`
    /// NVRAM cookie to set.
    fn set_try_cookies(&self, next_slot: Option<char>, tries: u32) -> Result<(), ProgrammerError>;

    /// Clear the legacy vboot1 `fwb_tries` counter.
    fn clear_fwb_tries(&self) -> Result<(), ProgrammerError>;
}

/// Emulation-mode backend: all reads and writes target a local file. A
/// section write loads the file, locates the section by FMAP, splices the
/// new bytes in place (truncating if the source section is larger than
/// the destination's), and rewrites the file.
#[derive(Debug, Clone)]
pub struct EmulationProgrammer {
    pub path: PathBuf,
}

impl EmulationProgrammer {
    pub fn new(path: impl Into<PathBuf>) -> EmulationProgrammer {
        EmulationProgrammer { path: path.into() }
    }
}

impl Programmer for EmulationProgrammer {
    fn read_image(&self) -> Result<Vec<u8>, ProgrammerError> {
        fs::read(&self.path).map_err(|e| ProgrammerError::Read(e.to_string()))
    }

    fn write(&self, bytes: &[u8], section: Option<&str>) -> Result<(), ProgrammerError> {
        match section {
            None => {
                info!("emulation: writing whole image ({} bytes) to {:?}", bytes.len(), self.path);
                fs::write(&self.path, bytes).map_err(|e| ProgrammerError::Write(e.to_string()))
            }
            Some(name) => {
                let mut dest = self.read_image()?;
                let fmap = FmapView::parse(&dest)
                    .ok_or_else(|| ProgrammerError::Write("destination has no FMAP".into()))?;
                let range = fmap
                    .find(name)
                    .ok_or_else(|| ProgrammerError::Write(format!("destination has no section {name}")))?;
                if !range.fits_within(dest.len()) {
                    return Err(ProgrammerError::Write(format!("section {name} out of bounds")));
                }
                let src = if bytes.len() > range.len {
                    warn!(
                        "emulation: source section {name} ({} bytes) truncated to fit destination ({})",
                        bytes.len(),
                        range.len
                    );
                    &bytes[..range.len]
                } else {
                    bytes
                };
                dest[range.offset..range.offset + src.len()].copy_from_slice(src);
                debug!("emulation: spliced section {name} ({} bytes) into {:?}", src.len(), self.path);
                fs::write(&self.path, &dest).map_err(|e| ProgrammerError::Write(e.to_string()))
            }
        }
    }

    // Emulation mode has no real hardware behind it; these report the
    // fixed defaults the system-properties override list is meant to
    // replace for any test that cares.
    fn wp_hw_status(&self) -> Option<bool> {
        None
    }
    fn wp_sw_status(&self) -> Option<bool> {
        None
    }
    fn mainfw_act(&self) -> Option<String> {
        None
    }
    fn tpm_fwver(&self) -> Option<i64> {
        None
    }
    fn fw_vboot2(&self) -> Option<bool> {
        None
    }
    fn platform_revision(&self) -> Option<String> {
        None
    }

    fn set_try_cookies(&self, next_slot: Option<char>, tries: u32) -> Result<(), ProgrammerError> {
        info!(
            "emulation: would set fw_try_count={tries}{}",
            next_slot.map(|s| format!(", fw_try_next={s}")).unwrap_or_default()
        );
        Ok(())
    }

    fn clear_fwb_tries(&self) -> Result<(), ProgrammerError> {
        info!("emulation: would clear fwb_tries");
        Ok(())
    }
}

/// Drain stdin to a temporary file and return its path, for `-i -`.
pub fn drain_stdin_to_tempfile() -> std::io::Result<PathBuf> {
    use std::io::Read;
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    let file = tempfile::NamedTempFile::new()?;
    let path = file.into_temp_path();
    fs::write(&path, &buf)?;
    Ok(path.keep()?)
}

/// Parse a `flashrom --wp-status`-style report: the contract is just that
/// the line contains one of the two fixed phrases.
pub fn parse_wp_status_line(line: &str) -> Option<bool> {
    if line.contains("write protect is enabled") {
        Some(true)
    } else if line.contains("write protect is disabled") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;

    /// A fully in-memory, independently steerable [`Programmer`], used to
    /// test [`crate::sysprops::SysProps`] and the policy layer without a
    /// real flash backend.
    #[derive(Debug, Default)]
    pub struct FakeProgrammer {
        image: RefCell<Vec<u8>>,
        mainfw_act: RefCell<Option<String>>,
        tpm_fwver: RefCell<Option<i64>>,
        fw_vboot2: RefCell<Option<bool>>,
        platform_revision: RefCell<Option<String>>,
        wp_hw: RefCell<Option<bool>>,
        wp_sw: RefCell<Option<bool>>,
        pub writes: RefCell<Vec<(Vec<u8>, Option<String>)>>,
        /// When set, every call to [`Programmer::write`] for a section
        /// matching this name fails instead of recording the write --
        /// used to exercise the "cookies are only attempted after a
        /// successful write" ordering guarantee.
        fail_write_for_section: RefCell<Option<String>>,
    }

    impl FakeProgrammer {
        pub fn new() -> FakeProgrammer {
            FakeProgrammer::default()
        }
        pub fn set_image(&self, bytes: Vec<u8>) {
            *self.image.borrow_mut() = bytes;
        }
        pub fn fail_writes_to(&self, section: &str) {
            *self.fail_write_for_section.borrow_mut() = Some(section.to_string());
        }
        pub fn set_mainfw_act(&self, v: Option<&str>) {
            *self.mainfw_act.borrow_mut() = v.map(str::to_string);
        }
        pub fn set_tpm_fwver(&self, v: Option<i64>) {
            *self.tpm_fwver.borrow_mut() = v;
        }
        pub fn set_fw_vboot2(&self, v: Option<bool>) {
            *self.fw_vboot2.borrow_mut() = v;
        }
        pub fn set_platform_revision(&self, v: Option<&str>) {
            *self.platform_revision.borrow_mut() = v.map(str::to_string);
        }
        pub fn set_wp_hw(&self, v: Option<bool>) {
            *self.wp_hw.borrow_mut() = v;
        }
        pub fn set_wp_sw(&self, v: Option<bool>) {
            *self.wp_sw.borrow_mut() = v;
        }
    }

    impl Programmer for FakeProgrammer {
        fn read_image(&self) -> Result<Vec<u8>, ProgrammerError> {
            Ok(self.image.borrow().clone())
        }
        fn write(&self, bytes: &[u8], section: Option<&str>) -> Result<(), ProgrammerError> {
            if self.fail_write_for_section.borrow().as_deref() == section {
                return Err(ProgrammerError::Write("injected failure".into()));
            }
            self.writes
                .borrow_mut()
                .push((bytes.to_vec(), section.map(str::to_string)));
            Ok(())
        }
        fn wp_hw_status(&self) -> Option<bool> {
            *self.wp_hw.borrow()
        }
        fn wp_sw_status(&self) -> Option<bool> {
            *self.wp_sw.borrow()
        }
        fn mainfw_act(&self) -> Option<String> {
            self.mainfw_act.borrow().clone()
        }
        fn tpm_fwver(&self) -> Option<i64> {
            *self.tpm_fwver.borrow()
        }
        fn fw_vboot2(&self) -> Option<bool> {
            *self.fw_vboot2.borrow()
        }
        fn platform_revision(&self) -> Option<String> {
            self.platform_revision.borrow().clone()
        }
        fn set_try_cookies(&self, next_slot: Option<char>, tries: u32) -> Result<(), ProgrammerError> {
            self.writes.borrow_mut().push((
                Vec::new(),
                Some(format!("cookies:{}:{}", next_slot.map(String::from).unwrap_or_default(), tries)),
            ));
            Ok(())
        }
        fn clear_fwb_tries(&self) -> Result<(), ProgrammerError> {
            self.writes.borrow_mut().push((Vec::new(), Some("clear_fwb_tries".to_string())));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmap::build_test_fmap;
    use std::io::Write as _;

    #[test]
    fn wp_status_line_parses_both_phrases() {
        assert_eq!(parse_wp_status_line("WP: write protect is enabled."), Some(true));
        assert_eq!(parse_wp_status_line("WP: write protect is disabled."), Some(false));
        assert_eq!(parse_wp_status_line("garbage"), None);
    }

    #[test]
    fn section_write_splices_and_truncates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let fmap = build_test_fmap(&[("RW_SECTION_A", 0, 8)]);
        let mut image = vec![0u8; 8];
        image.extend_from_slice(&fmap);
        file.write_all(&image).unwrap();

        let prog = EmulationProgrammer::new(file.path());
        prog.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], Some("RW_SECTION_A")).unwrap();

        let result = prog.read_image().unwrap();
        assert_eq!(&result[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
