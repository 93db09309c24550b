//! The update policy: chooses Full, RW-only, Try-RW, Legacy, or Factory,
//! decides the target RW slot, sets try-next cookies, and issues the
//! writes. This is the top-level entry point the rest of the engine
//! exists to serve.

use log::{debug, info, warn};

use crate::cbfs;
use crate::compat;
use crate::config::{UpdateMode, UpdaterConfig};
use crate::error::{UpdateError, UpdateResult};
use crate::preservation;
use crate::programmer::Programmer;
use crate::quirks;
use crate::sysprops::MainFwAct;

/// Number of boot tries granted to a newly-written RW slot; two extra are
/// granted when an EC image is also part of this update.
fn try_count(has_ec_image: bool) -> u32 {
    6 + if has_ec_image { 2 } else { 0 }
}

fn opposite_slot(active: MainFwAct) -> (&'static str, char) {
    match active {
        MainFwAct::A | MainFwAct::Unknown => ("RW_SECTION_B", 'B'),
        MainFwAct::B => ("RW_SECTION_A", 'A'),
    }
}

/// Run the full update decision and write sequence against `cfg`.
pub fn update(cfg: &mut UpdaterConfig) -> UpdateResult<()> {
    if cfg.target.is_none() {
        return Err(UpdateError::NoImage);
    }

    let programmer = cfg
        .programmer()
        .map_err(|e| UpdateError::SystemImage(e.to_string()))?;
    cfg.platform_ver = cfg.sys_props.platform_ver(&programmer);

    cfg.quirks.clone().try_apply(quirks::DAISY_SNOW_DUAL_MODEL, cfg)?;
    cfg.quirks.clone().try_apply(quirks::MIN_PLATFORM_VERSION, cfg)?;

    if cfg.current.is_none() {
        cfg.load_current_from_programmer()
            .map_err(|e| UpdateError::SystemImage(e.to_string()))?;
    }

    {
        let from = cfg.current.as_ref().unwrap();
        let to = cfg.target.as_ref().unwrap();
        compat::check_platform(from, to)?;
    }

    let wp = cfg.sys_props.write_protect_enabled(&programmer);
    debug!("write protect enabled: {wp}");

    // Both quirks already return the right error class for this call
    // site (`SystemImage`, `InvalidImage`).
    cfg.quirks.clone().try_apply(quirks::ENLARGE_IMAGE, cfg)?;
    cfg.quirks.clone().try_apply(quirks::EVE_SMM_STORE, cfg)?;

    match cfg.mode {
        UpdateMode::Legacy => write_legacy(cfg, &programmer),
        UpdateMode::Factory | UpdateMode::FactoryInstall => {
            if wp {
                return Err(UpdateError::Platform("factory mode needs WP disabled".into()));
            }
            write_full(cfg, &programmer, false)
        }
        _ if cfg.try_update => match try_rw(cfg, &programmer, wp) {
            Err(UpdateError::NeedRoUpdate) if !wp => write_full(cfg, &programmer, true),
            other => other,
        },
        _ if wp => write_rw_only(cfg, &programmer),
        _ => write_full(cfg, &programmer, true),
    }
}

fn write_legacy(cfg: &UpdaterConfig, programmer: &impl Programmer) -> UpdateResult<()> {
    let target = cfg.target.as_ref().unwrap();
    let bytes = target
        .section_bytes("RW_LEGACY")
        .ok_or_else(|| UpdateError::InvalidImage("target has no RW_LEGACY".into()))?;
    info!("legacy mode: writing RW_LEGACY only, bypassing key/TPM checks");
    programmer
        .write(bytes, Some("RW_LEGACY"))
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))
}

fn write_rw_only(cfg: &mut UpdaterConfig, programmer: &impl Programmer) -> UpdateResult<()> {
    {
        let from = cfg.current.as_ref().unwrap();
        let to = cfg.target.as_ref().unwrap();
        compat::check_root_key(from, to)?;
    }
    let tpm_fwver = cfg.sys_props_tpm_fwver(programmer);
    {
        let to = cfg.target.as_ref().unwrap();
        compat::check_tpm_rollback(to, tpm_fwver, cfg.force_update)?;
    }

    let to = cfg.target.as_ref().unwrap();
    for section in ["RW_SECTION_A", "RW_SECTION_B", "RW_SHARED"] {
        let bytes = to
            .section_bytes(section)
            .ok_or_else(|| UpdateError::InvalidImage(format!("target has no {section}")))?;
        programmer
            .write(bytes, Some(section))
            .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;
    }
    if let Some(bytes) = to.section_bytes("RW_LEGACY") {
        if let Err(e) = programmer.write(bytes, Some("RW_LEGACY")) {
            warn!("RW-only: RW_LEGACY write failed (non-fatal): {e}");
        }
    }
    Ok(())
}

fn write_full(cfg: &mut UpdaterConfig, programmer: &impl Programmer, check_tpm: bool) -> UpdateResult<()> {
    if check_tpm {
        let tpm_fwver = cfg.sys_props_tpm_fwver(programmer);
        let to = cfg.target.as_ref().unwrap();
        compat::check_tpm_rollback(to, tpm_fwver, cfg.force_update)?;
    }
    let quirks = cfg.quirks.clone();
    let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_mut().unwrap());
    let errors = preservation::preserve_images(&quirks, from, to);
    if !errors.is_empty() {
        debug!("full update: {} preservation sub-failure(s) logged and ignored", errors.len());
    }

    let target = cfg.target.as_ref().unwrap();
    programmer
        .write(&target.bytes, None)
        .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;

    if let Some(ec) = &cfg.ec_image {
        programmer
            .write(&ec.bytes, None)
            .map_err(|e| UpdateError::WriteFirmware(format!("EC image: {e}")))?;
    }
    if let Some(pd) = &cfg.pd_image {
        programmer
            .write(&pd.bytes, None)
            .map_err(|e| UpdateError::WriteFirmware(format!("PD image: {e}")))?;
    }
    Ok(())
}

fn try_rw(cfg: &mut UpdaterConfig, programmer: &impl Programmer, wp: bool) -> UpdateResult<()> {
    {
        let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_mut().unwrap());
        if let Err(e) = preservation::preserve_gbb(from, to) {
            warn!("try-rw: GBB preservation failed: {e}");
        }
    }

    if !wp {
        let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_ref().unwrap());
        let ro_differs = match (from.section_bytes("RO_SECTION"), to.section_bytes("RO_SECTION")) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };
        if ro_differs {
            return Err(UpdateError::NeedRoUpdate);
        }
    }

    {
        let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_ref().unwrap());
        compat::check_root_key(from, to)?;
    }
    let tpm_fwver = cfg.sys_props_tpm_fwver(programmer);
    {
        let to = cfg.target.as_ref().unwrap();
        compat::check_tpm_rollback(to, tpm_fwver, cfg.force_update)?;
    }

    let vboot2 = cfg.sys_props.fw_vboot2(programmer);
    let active = if vboot2 {
        cfg.sys_props.mainfw_act(programmer)
    } else {
        MainFwAct::A
    };
    let (slot_section, slot_letter) = opposite_slot(active);

    let differs = {
        let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_ref().unwrap());
        match (from.section_bytes(slot_section), to.section_bytes(slot_section)) {
            (Some(a), Some(b)) => a != b,
            _ => return Err(UpdateError::Target(format!("could not compare {slot_section}"))),
        }
    };

    if !differs && !cfg.force_update {
        info!("try-rw: target slot {slot_letter} already matches, nothing to write");
        if !vboot2 {
            programmer
                .clear_fwb_tries()
                .map_err(|e| UpdateError::SetCookies(e.to_string()))?;
        }
    } else {
        let bytes = cfg
            .target
            .as_ref()
            .unwrap()
            .section_bytes(slot_section)
            .ok_or_else(|| UpdateError::InvalidImage(format!("target has no {slot_section}")))?
            .to_vec();
        programmer
            .write(&bytes, Some(slot_section))
            .map_err(|e| UpdateError::WriteFirmware(e.to_string()))?;

        let tries = try_count(cfg.ec_image.is_some());
        let next_slot = vboot2.then_some(slot_letter);
        programmer
            .set_try_cookies(next_slot, tries)
            .map_err(|e| UpdateError::SetCookies(e.to_string()))?;
    }

    try_write_legacy_if_tagged(cfg, programmer);
    Ok(())
}

/// If `RW_LEGACY` carries the `cros_allow_auto_update` CBFS tag on both
/// sides and the sections differ, write it too. Failure is logged and
/// swallowed -- this write is intentionally non-fatal in Try-RW.
///
/// Both the current and target `RW_LEGACY` regions are checked for the
/// tag independently, rather than reusing one side's check for both --
/// a board that drops the tag in a new image should stop getting
/// auto-updated legacy payloads even if the old image still carried it.
fn try_write_legacy_if_tagged(cfg: &UpdaterConfig, programmer: &impl Programmer) {
    let (from, to) = (cfg.current.as_ref().unwrap(), cfg.target.as_ref().unwrap());
    let (Some(from_legacy), Some(to_legacy)) = (from.section_bytes("RW_LEGACY"), to.section_bytes("RW_LEGACY")) else {
        return;
    };
    let both_tagged = cbfs::has_tag(from_legacy, "cros_allow_auto_update") && cbfs::has_tag(to_legacy, "cros_allow_auto_update");
    if !both_tagged || from_legacy == to_legacy {
        return;
    }
    if let Err(e) = programmer.write(to_legacy, Some("RW_LEGACY")) {
        warn!("try-rw: RW_LEGACY auto-update write failed (non-fatal): {e}");
    }
}

impl UpdaterConfig {
    fn sys_props_tpm_fwver(&mut self, programmer: &impl Programmer) -> i64 {
        self.sys_props.tpm_fwver(programmer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmap::build_test_fmap;
    use crate::image::Image;
    use crate::programmer::test_support::FakeProgrammer;
    use crate::vboot;
    use crate::vboot::test_support::{make_keyblock, make_keypair};

    fn build_signed_image(ro: &str, rw_a: &[u8], rw_b: &[u8]) -> (Image, vboot::test_support::TestKeypair) {
        let keypair = make_keypair(1);
        let (vblock_a, _) = make_keyblock(&keypair, 1, 1);
        let (vblock_b, _) = make_keyblock(&keypair, 1, 1);

        let mut ro_bytes = ro.as_bytes().to_vec();
        ro_bytes.resize(ro_bytes.len() + 4, 0);

        // GBB carrying the root key, laid out by hand.
        let gbb_header_len = 4 + 2 + 2 + 4 + 4 + 4 * (4 + 4);
        let hwid = b"TESTDEVICE\0";
        let rootkey_offset = gbb_header_len as u32 + hwid.len() as u32;
        let mut gbb = Vec::new();
        gbb.extend_from_slice(b"$GBB");
        gbb.extend_from_slice(&1u16.to_le_bytes());
        gbb.extend_from_slice(&1u16.to_le_bytes());
        gbb.extend_from_slice(&(gbb_header_len as u32).to_le_bytes());
        gbb.extend_from_slice(&0u32.to_le_bytes());
        gbb.extend_from_slice(&(gbb_header_len as u32).to_le_bytes());
        gbb.extend_from_slice(&(hwid.len() as u32).to_le_bytes());
        gbb.extend_from_slice(&rootkey_offset.to_le_bytes());
        gbb.extend_from_slice(&(keypair.packed_public.len() as u32).to_le_bytes());
        gbb.extend_from_slice(&rootkey_offset.to_le_bytes()); // bmpfv (reuse, len 0 below)
        gbb.extend_from_slice(&0u32.to_le_bytes());
        gbb.extend_from_slice(&rootkey_offset.to_le_bytes()); // recovery key (reuse, len 0)
        gbb.extend_from_slice(&0u32.to_le_bytes());
        gbb.extend_from_slice(hwid);
        gbb.extend_from_slice(&keypair.packed_public);

        let layout_ro_end = ro_bytes.len() as u32;
        let gbb_offset = layout_ro_end;
        let vblock_a_offset = gbb_offset + gbb.len() as u32;
        let vblock_b_offset = vblock_a_offset + vblock_a.len() as u32;
        let rw_a_offset = vblock_b_offset + vblock_b.len() as u32;
        let rw_b_offset = rw_a_offset + rw_a.len() as u32;
        let ro_section_offset = 0u32;
        let ro_section_len = rw_a_offset; // everything before RW counts as RO_SECTION

        let fmap = build_test_fmap(&[
            ("RO_FRID", 0, layout_ro_end),
            ("RO_SECTION", ro_section_offset, ro_section_len),
            ("GBB", gbb_offset, gbb.len() as u32),
            ("VBLOCK_A", vblock_a_offset, vblock_a.len() as u32),
            ("VBLOCK_B", vblock_b_offset, vblock_b.len() as u32),
            ("RW_SECTION_A", rw_a_offset, rw_a.len() as u32),
            ("RW_SECTION_B", rw_b_offset, rw_b.len() as u32),
        ]);

        let mut bytes = ro_bytes;
        bytes.extend_from_slice(&gbb);
        bytes.extend_from_slice(&vblock_a);
        bytes.extend_from_slice(&vblock_b);
        bytes.extend_from_slice(rw_a);
        bytes.extend_from_slice(rw_b);
        bytes.extend_from_slice(&fmap);

        (Image::from_bytes(bytes, "host", None), keypair)
    }

    #[test]
    fn try_rw_writes_only_opposite_slot_when_wp_enabled() {
        let (current, _kp) = build_signed_image("Google.Link.1.0.0", &[1u8; 16], &[2u8; 16]);
        let (target, _kp2) = build_signed_image("Google.Link.1.0.1", &[1u8; 16], &[9u8; 16]);

        let mut cfg = UpdaterConfig::new();
        cfg.current = Some(current);
        cfg.target = Some(target);
        cfg.try_update = true;

        let fp = FakeProgrammer::new();
        fp.set_wp_hw(Some(true));
        fp.set_wp_sw(Some(true));
        fp.set_fw_vboot2(Some(false));
        fp.set_tpm_fwver(Some(0x10001));

        let wp = cfg.sys_props.write_protect_enabled(&fp);
        assert!(wp);
        let result = try_rw(&mut cfg, &fp, wp);
        assert!(result.is_ok(), "{result:?}");

        let writes = fp.writes.borrow();
        let section_writes: Vec<_> = writes.iter().filter(|(_, s)| s.as_deref() == Some("RW_SECTION_B")).collect();
        assert_eq!(section_writes.len(), 1);
        assert_eq!(section_writes[0].0, vec![9u8; 16]);
        assert!(!writes.iter().any(|(_, s)| s.as_deref() == Some("RW_SECTION_A")));
    }

    #[test]
    fn try_rw_does_not_set_cookies_when_slot_write_fails() {
        let (current, _kp) = build_signed_image("Google.Link.1.0.0", &[1u8; 16], &[2u8; 16]);
        let (target, _kp2) = build_signed_image("Google.Link.1.0.1", &[1u8; 16], &[9u8; 16]);

        let mut cfg = UpdaterConfig::new();
        cfg.current = Some(current);
        cfg.target = Some(target);
        cfg.try_update = true;

        let fp = FakeProgrammer::new();
        fp.set_wp_hw(Some(true));
        fp.set_wp_sw(Some(true));
        fp.set_fw_vboot2(Some(false));
        fp.set_tpm_fwver(Some(0x10001));
        fp.fail_writes_to("RW_SECTION_B");

        let result = try_rw(&mut cfg, &fp, true);
        assert!(result.is_err(), "write failure must surface as an error");

        // Cookies are only ever written via set_try_cookies/clear_fwb_tries,
        // which the fake records as a synthetic "cookies:..."/"clear_fwb_tries"
        // write entry. None should appear: the slot write failed first, so
        // try_rw must return before reaching the cookie step.
        let writes = fp.writes.borrow();
        assert!(!writes.iter().any(|(_, s)| {
            s.as_deref().map(|s| s.starts_with("cookies:") || s == "clear_fwb_tries").unwrap_or(false)
        }));
    }

    #[test]
    fn try_rw_returns_need_ro_update_when_ro_differs_and_wp_disabled() {
        let (mut current, _kp) = build_signed_image("Google.Link.1.0.0", &[1u8; 16], &[2u8; 16]);
        let (target, _kp2) = build_signed_image("Google.Link.1.0.1", &[1u8; 16], &[9u8; 16]);
        // Force RO_SECTION to visibly differ.
        current.bytes[0] ^= 0xFF;

        let mut cfg = UpdaterConfig::new();
        cfg.current = Some(current);
        cfg.target = Some(target);
        cfg.try_update = true;

        let fp = FakeProgrammer::new();
        let result = try_rw(&mut cfg, &fp, false);
        assert!(matches!(result, Err(UpdateError::NeedRoUpdate)));
    }

    #[test]
    fn update_reads_platform_ver_from_sys_props_before_gating_quirks() {
        // write_full (Full mode, the path this test takes) never checks the
        // root key, so the two images don't need to share a keypair here.
        let (current, _kp) = build_signed_image("Google.Link.1.0.0", &[1u8; 16], &[2u8; 16]);
        let (target, _kp2) = build_signed_image("Google.Link.1.0.0", &[1u8; 16], &[2u8; 16]);

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &current.bytes).unwrap();

        let mut cfg = UpdaterConfig::new();
        cfg.emulation_path = Some(file.path().to_path_buf());
        cfg.target = Some(target);
        cfg.try_update = false;
        cfg.quirks.set(quirks::MIN_PLATFORM_VERSION, 3).unwrap();
        // platform_ver is field index 3 in mainfw_act,tpm_fwver,fw_vboot2,platform_ver,wp_hw,wp_sw.
        cfg.sys_props.apply_overrides(",,,5,0,0").unwrap();
        cfg.sys_props.apply_overrides(",65537").unwrap(); // tpm_fwver 0x10001 == dkv 1, fv 1

        // Before the fix, cfg.platform_ver stayed at its -1 default and this
        // call would fail with "Need platform version >= 3 (current is -1)"
        // even though sys_props reports platform_ver=5.
        let result = update(&mut cfg);
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(cfg.platform_ver, 5);
    }
}
