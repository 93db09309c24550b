//! Compatibility gates the update policy runs before it will write
//! anything: platform prefix match, root-key match, and TPM anti-rollback.

use log::warn;

use crate::error::{UpdateError, UpdateResult};
use crate::image::Image;
use crate::util::dotted_prefix;
use crate::vboot;

/// `prefix(from.ro_version) == prefix(to.ro_version)`, where `prefix(v)`
/// is `v` up to and including the first `.`. Absence of a `.` in either
/// version is itself an error, not a free pass.
pub fn check_platform(from: &Image, to: &Image) -> UpdateResult<()> {
    let from_prefix = dotted_prefix(&from.ro_version)
        .ok_or_else(|| UpdateError::Platform("current image has no dotted platform prefix".into()))?;
    let to_prefix = dotted_prefix(&to.ro_version)
        .ok_or_else(|| UpdateError::Platform("target image has no dotted platform prefix".into()))?;
    if from_prefix != to_prefix {
        return Err(UpdateError::Platform(format!(
            "{from_prefix} (current) vs {to_prefix} (target)"
        )));
    }
    Ok(())
}

/// Verify `to`'s `VBLOCK_A` keyblock against `from`'s GBB root key. On
/// failure, compare root-key SHA1s (when `to`'s root key is readable at
/// all) to distinguish "same key, RW likely corrupt" from "different
/// key, wrong signer".
pub fn check_root_key(from: &Image, to: &Image) -> UpdateResult<()> {
    let from_fmap = from.fmap.as_ref().ok_or_else(|| UpdateError::RootKey("current image has no FMAP".into()))?;
    let to_fmap = to.fmap.as_ref().ok_or_else(|| UpdateError::RootKey("target image has no FMAP".into()))?;

    let from_gbb = vboot::find_gbb(&from.bytes, from_fmap).map_err(|e| UpdateError::RootKey(format!("current GBB invalid: {e}")))?;
    let root_key = vboot::get_rootkey(&from.bytes, &from_gbb).map_err(|e| UpdateError::RootKey(format!("current root key invalid: {e}")))?;

    let keyblock = vboot::get_keyblock(&to.bytes, to_fmap, "VBLOCK_A").map_err(|e| UpdateError::RootKey(format!("target VBLOCK_A invalid: {e}")))?;
    let keyblock_bytes = keyblock.section.slice(&to.bytes).to_vec();

    if let Err(e) = vboot::verify_keyblock(&keyblock_bytes, &keyblock, &root_key) {
        let diagnostic = match (to_gbb_rootkey(to), ) {
            (Some(to_key),) => {
                if to_key.sha1_hex() == root_key.sha1_hex() {
                    "same root key as current image -- RW is likely corrupt, not re-keyed".to_string()
                } else {
                    format!(
                        "different root key than current image (current sha1 {}, target sha1 {})",
                        root_key.sha1_hex(),
                        to_key.sha1_hex()
                    )
                }
            }
            (None,) => "target root key could not be read for comparison".to_string(),
        };
        return Err(UpdateError::RootKey(format!("{e}: {diagnostic}")));
    }
    Ok(())
}

fn to_gbb_rootkey(to: &Image) -> Option<vboot::PackedKey> {
    let fmap = to.fmap.as_ref()?;
    let gbb = vboot::find_gbb(&to.bytes, fmap).ok()?;
    vboot::get_rootkey(&to.bytes, &gbb).ok()
}

/// `(data_key_version, firmware_version)` extracted from `to`'s
/// `VBLOCK_A`, compared componentwise against the TPM's stored floor.
/// `tpm_fwver < 0` (a read error, not the legal "uninitialized" value of
/// `0`) is rejected outright. `force_update` downgrades a real rollback
/// failure to a warning and lets the update proceed.
pub fn check_tpm_rollback(to: &Image, tpm_fwver: i64, force_update: bool) -> UpdateResult<()> {
    let to_fmap = to.fmap.as_ref().ok_or_else(|| UpdateError::TpmRollback("target image has no FMAP".into()))?;
    let (dkv_img, fv_img) = vboot::get_key_versions(&to.bytes, to_fmap, "VBLOCK_A")
        .map_err(|e| UpdateError::TpmRollback(format!("target VBLOCK_A invalid: {e}")))?;

    if tpm_fwver < 0 {
        let err = UpdateError::TpmRollback(format!("Invalid tpm_fwver: {tpm_fwver}"));
        return fail_or_warn(err, force_update);
    }

    let tpm_dkv = (tpm_fwver >> 16) as u32;
    let tpm_fv = (tpm_fwver & 0xFFFF) as u32;

    if tpm_dkv > dkv_img {
        let err = UpdateError::TpmRollback(format!(
            "Data key version rollback detected ({tpm_dkv}->{dkv_img})"
        ));
        return fail_or_warn(err, force_update);
    }
    if tpm_fv > fv_img {
        let err = UpdateError::TpmRollback(format!(
            "Firmware version rollback detected ({tpm_fv}->{fv_img})"
        ));
        return fail_or_warn(err, force_update);
    }
    Ok(())
}

fn fail_or_warn(err: UpdateError, force_update: bool) -> UpdateResult<()> {
    if force_update {
        warn!("TPM anti-rollback check failed but --force was given, continuing: {err}");
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmap::build_test_fmap;

    fn image_with_ro(ro: &str) -> Image {
        let mut data = ro.as_bytes().to_vec();
        data.resize(data.len() + 4, 0);
        let ro_len = data.len() as u32;
        let fmap = build_test_fmap(&[("RO_FRID", 0, ro_len)]);
        data.extend_from_slice(&fmap);
        Image::from_bytes(data, "host", None)
    }

    #[test]
    fn platform_prefix_mismatch_errors() {
        let from = image_with_ro("Google.Peppy.1.2.3");
        let to = image_with_ro("Google.Link.1.2.3");
        assert!(check_platform(&from, &to).is_err());
    }

    #[test]
    fn platform_prefix_match_ok() {
        let from = image_with_ro("Google.Link.1.0.0");
        let to = image_with_ro("Google.Link.2.0.0");
        assert!(check_platform(&from, &to).is_ok());
    }

    #[test]
    fn missing_dot_is_error() {
        let from = image_with_ro("noversionatall");
        let to = image_with_ro("Google.Link.1.0.0");
        assert!(check_platform(&from, &to).is_err());
    }

    #[test]
    fn tpm_rollback_rejects_negative_fwver() {
        // Build a minimal image with a VBLOCK_A readable enough to reach
        // the tpm_fwver check (versions taken from a real keyblock in
        // vboot::tests rather than faked here).
        let keypair = vboot::test_support::make_keypair(1);
        let (blob, _kb) = vboot::test_support::make_keyblock(&keypair, 1, 1);
        let fmap = build_test_fmap(&[("VBLOCK_A", 0, blob.len() as u32)]);
        let mut data = blob;
        data.extend_from_slice(&fmap);
        let image = Image::from_bytes(data, "host", None);

        let err = check_tpm_rollback(&image, -1, false).unwrap_err();
        assert_eq!(err.to_string(), "Invalid tpm_fwver: -1");
    }

    #[test]
    fn tpm_rollback_detects_data_key_regression() {
        let keypair = vboot::test_support::make_keypair(1);
        let (blob, _kb) = vboot::test_support::make_keyblock(&keypair, 1, 1);
        let fmap = build_test_fmap(&[("VBLOCK_A", 0, blob.len() as u32)]);
        let mut data = blob;
        data.extend_from_slice(&fmap);
        let image = Image::from_bytes(data, "host", None);

        // tpm_dkv = 2, tpm_fv = 1 -> dkv_img(1) < tpm_dkv(2), rollback.
        let tpm_fwver = (2i64 << 16) | 1;
        let err = check_tpm_rollback(&image, tpm_fwver, false).unwrap_err();
        assert_eq!(err.to_string(), "Data key version rollback detected (2->1)");
    }

    #[test]
    fn force_update_downgrades_to_warning() {
        let keypair = vboot::test_support::make_keypair(1);
        let (blob, _kb) = vboot::test_support::make_keyblock(&keypair, 1, 1);
        let fmap = build_test_fmap(&[("VBLOCK_A", 0, blob.len() as u32)]);
        let mut data = blob;
        data.extend_from_slice(&fmap);
        let image = Image::from_bytes(data, "host", None);

        assert!(check_tpm_rollback(&image, -1, true).is_ok());
    }
}
