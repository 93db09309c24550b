//! Parse the flash map (FMAP) header and expose named sections as
//! `(offset, size)` slices of an image buffer.
//!
//! An FMAP is a small, self-describing table embedded somewhere in a flash
//! image. It carries no fixed address, so we have to scan for the
//! signature the same way [`crate::vboot`] scans for the GBB signature.

use std::collections::HashMap;

use crate::util::nul_terminated_str;

const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
const FMAP_NAMELEN: usize = 32;
// signature(8) + ver_major(1) + ver_minor(1) + base(8) + size(4) + name(32) + nareas(2)
const FMAP_HEADER_LEN: usize = 8 + 1 + 1 + 8 + 4 + FMAP_NAMELEN + 2;
// offset(4) + size(4) + name(32) + flags(2)
const FMAP_AREA_LEN: usize = 4 + 4 + FMAP_NAMELEN + 2;

/// A non-owning `(offset, length)` pair named by FMAP.
///
/// Valid only while the image buffer it was derived from is pinned; it is
/// never stored alongside a mutable borrow of that buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub offset: usize,
    pub len: usize,
}

impl Section {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn fits_within(&self, buf_len: usize) -> bool {
        self.end() <= buf_len
    }

    pub fn slice<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.offset..self.end()]
    }

    pub fn slice_mut<'a>(&self, image: &'a mut [u8]) -> &'a mut [u8] {
        &mut image[self.offset..self.end()]
    }
}

/// A read-only view over an image's FMAP table.
#[derive(Debug, Clone, Default)]
pub struct FmapView {
    areas: HashMap<String, Section>,
}

impl FmapView {
    /// Scan `image` for an FMAP header and parse its area table.
    ///
    /// Returns `None` if no signature is found or the header claims more
    /// area entries than fit in the buffer.
    pub fn parse(image: &[u8]) -> Option<FmapView> {
        let sig_at = find_signature(image, FMAP_SIGNATURE)?;
        if sig_at + FMAP_HEADER_LEN > image.len() {
            return None;
        }
        let header = &image[sig_at..sig_at + FMAP_HEADER_LEN];
        let nareas = u16::from_le_bytes([header[46], header[47]]) as usize;

        let areas_start = sig_at + FMAP_HEADER_LEN;
        let areas_end = areas_start + nareas * FMAP_AREA_LEN;
        if areas_end > image.len() {
            return None;
        }

        let mut areas = HashMap::with_capacity(nareas);
        for i in 0..nareas {
            let entry = &image[areas_start + i * FMAP_AREA_LEN..areas_start + (i + 1) * FMAP_AREA_LEN];
            let offset = u32::from_le_bytes(entry[0..4].try_into().unwrap()) as usize;
            let size = u32::from_le_bytes(entry[4..8].try_into().unwrap()) as usize;
            let name = nul_terminated_str(&entry[8..8 + FMAP_NAMELEN]);
            areas.insert(name, Section { offset, len: size });
        }

        Some(FmapView { areas })
    }

    pub fn find(&self, name: &str) -> Option<Section> {
        self.areas.get(name).copied()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.areas.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.areas.keys().map(|s| s.as_str())
    }
}

fn find_signature(haystack: &[u8], sig: &[u8]) -> Option<usize> {
    if haystack.len() < sig.len() {
        return None;
    }
    haystack.windows(sig.len()).position(|w| w == sig)
}


#[cfg(test)]
pub(crate) fn build_test_fmap(areas: &[(&str, u32, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(FMAP_SIGNATURE);
    out.push(1); // ver_major
    out.push(1); // ver_minor
    out.extend_from_slice(&0u64.to_le_bytes()); // base
    out.extend_from_slice(&0u32.to_le_bytes()); // size (unused by our parser)
    let mut name = [0u8; FMAP_NAMELEN];
    name[..4].copy_from_slice(b"FMAP");
    out.extend_from_slice(&name);
    out.extend_from_slice(&(areas.len() as u16).to_le_bytes());

    for (name, offset, size) in areas {
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        let mut namebuf = [0u8; FMAP_NAMELEN];
        let bytes = name.as_bytes();
        namebuf[..bytes.len()].copy_from_slice(bytes);
        out.extend_from_slice(&namebuf);
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
    }

    out
}
