//! Byte-exact copy of designated sections from the current image into the
//! target image before it is written, so state the board needs to keep
//! (VPD, NVRAM, event log, HWID, ME lock) survives the update.

use log::warn;

use crate::image::Image;
use crate::quirks::{self, Quirks};
use crate::vboot;

/// Copy `min(from.size, to.size)` bytes of section `name` from `from`
/// into `to` at `to`'s offset. Memmove semantics: if the source is
/// larger the destination is truncated (with a warning); if smaller, the
/// untouched tail of the destination is left as-is.
///
/// Idempotent: running this twice in a row against the same `from`
/// leaves `to` unchanged the second time, since it always copies the
/// same prefix to the same destination range.
pub fn preserve_section(from: &Image, to: &mut Image, name: &str) -> Result<(), String> {
    let src_range = from.section(name).ok_or_else(|| format!("{name}: missing from source image"))?;
    let dst_range = to.section(name).ok_or_else(|| format!("{name}: missing from destination image"))?;

    if !src_range.fits_within(from.bytes.len()) || !dst_range.fits_within(to.bytes.len()) {
        return Err(format!("{name}: section out of bounds"));
    }

    let copy_len = src_range.len.min(dst_range.len);
    if src_range.len > dst_range.len {
        warn!(
            "preserve_section {name}: source is {} bytes, destination only {}; truncating",
            src_range.len, dst_range.len
        );
    }

    let src_bytes = from.bytes[src_range.offset..src_range.offset + copy_len].to_vec();
    to.bytes[dst_range.offset..dst_range.offset + copy_len].copy_from_slice(&src_bytes);
    Ok(())
}

/// Preserve the GBB's 32-bit flags word and HWID string.
///
/// The destination HWID field is zeroed first, then exactly
/// `strlen(source_hwid)` bytes are copied in -- never the full field
/// width, so a shorter new HWID doesn't leave stale trailing bytes from
/// whatever the destination previously held.
pub fn preserve_gbb(from: &Image, to: &mut Image) -> Result<(), String> {
    let from_fmap = from.fmap.as_ref().ok_or("source image has no FMAP")?;
    let to_fmap = to.fmap.as_ref().ok_or("destination image has no FMAP")?;
    let from_gbb = vboot::find_gbb(&from.bytes, from_fmap).map_err(|e| format!("source GBB invalid: {e}"))?;
    let to_gbb = vboot::find_gbb(&to.bytes, to_fmap).map_err(|e| format!("destination GBB invalid: {e}"))?;

    let hwid_str = from_gbb.hwid_str(&from.bytes);
    let hwid_bytes = hwid_str.as_bytes();
    if hwid_bytes.len() + 1 > to_gbb.hwid_size as usize {
        return Err(format!(
            "source HWID ({} bytes incl. NUL) does not fit destination HWID field ({} bytes)",
            hwid_bytes.len() + 1,
            to_gbb.hwid_size
        ));
    }

    let to_hwid_range = to_gbb.hwid_range();
    let to_hwid = to_hwid_range.slice_mut(&mut to.bytes);
    to_hwid.fill(0);
    to_hwid[..hwid_bytes.len()].copy_from_slice(hwid_bytes);

    // Flags live right after the fixed header fields; we already parsed
    // the struct, so write through the same field offset convention
    // `vboot::find_gbb` reads from (signature+major+minor, 8 bytes in).
    let flags_offset = to_gbb.section.offset + 8;
    to.bytes[flags_offset..flags_offset + 4].copy_from_slice(&from_gbb.flags.to_le_bytes());

    Ok(())
}

/// If the source has no `SI_ME`, do nothing. If the source `SI_ME` is
/// entirely erased (`0xFF`), the ME is locked: preserve `SI_DESC` so the
/// read-only descriptor stays untouched. Otherwise the ME is unlocked
/// already, so apply `unlock_me_for_update` if the user asked for it.
pub fn preserve_management_engine(
    quirks: &Quirks,
    from: &Image,
    to: &mut Image,
) -> Result<(), String> {
    if !from.has_section("SI_ME") {
        return Ok(());
    }
    let me_bytes = from.section_bytes("SI_ME").ok_or("SI_ME section out of bounds")?;
    let me_locked = me_bytes.iter().all(|&b| b == 0xFF);

    if me_locked {
        preserve_section(from, to, "SI_DESC")
    } else if quirks.value(quirks::UNLOCK_ME_FOR_UPDATE) != 0 {
        // The unlock patch itself is applied by the quirk's own `apply`
        // at the point the policy layer calls it; preservation only
        // needs to skip locking SI_DESC in this branch.
        Ok(())
    } else {
        Ok(())
    }
}

/// Always-preserved sections, in order, followed by the conditional set
/// that only runs when present in the source.
const ALWAYS_PRESERVE: &[&str] = &["RO_VPD", "RW_VPD"];
const CONDITIONAL_PRESERVE: &[&str] = &[
    "RO_PRESERVE",
    "RW_PRESERVE",
    "RW_NVRAM",
    "RW_ELOG",
    "SMMSTORE",
    "RO_FSG",
];

/// Run the full preservation sequence (§4.E): GBB, ME, VPD, then every
/// conditional section present in the source. Sub-failures accumulate
/// and are returned together; none is fatal to the others.
pub fn preserve_images(quirks: &Quirks, from: &Image, to: &mut Image) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(e) = preserve_gbb(from, to) {
        errors.push(format!("GBB: {e}"));
    }
    if let Err(e) = preserve_management_engine(quirks, from, to) {
        errors.push(format!("ME: {e}"));
    }
    for name in ALWAYS_PRESERVE {
        if let Err(e) = preserve_section(from, to, name) {
            errors.push(format!("{name}: {e}"));
        }
    }
    for name in CONDITIONAL_PRESERVE {
        if from.has_section(name) {
            if let Err(e) = preserve_section(from, to, name) {
                errors.push(format!("{name}: {e}"));
            }
        }
    }

    if !errors.is_empty() {
        warn!("preserve_images: {} sub-failure(s): {:?}", errors.len(), errors);
    }
    errors
}
