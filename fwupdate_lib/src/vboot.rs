//! Locate and validate the verified-boot structures inside an AP firmware
//! image: the GBB, the root key it carries, and the keyblock/preamble pair
//! at the front of each RW slot's vblock.

use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use crate::fmap::{FmapView, Section};
use crate::util::nul_terminated_str;

const GBB_SIGNATURE: &[u8; 4] = b"$GBB";
const GBB_SUPPORTED_MAJOR_VERSION: u16 = 1;
// signature(4) + major(2) + minor(2) + header_size(4) + flags(4)
//   + 4 * (offset(4) + size(4))
const GBB_HEADER_SIZE: usize = 4 + 2 + 2 + 4 + 4 + 4 * (4 + 4);
const GBB_SCAN_STRIDE: usize = 4;

const KEYBLOCK_MAGIC: &[u8; 8] = b"CHROMEOS";
// magic(8) + keyblock_size(4) + data_key_algorithm(4) + data_key_version(4)
//   + data_key_len(4) + data_key_offset(4) + signature_algorithm(4)
//   + signature_len(4) + signature_offset(4)
const KEYBLOCK_FIXED_SIZE: usize = 8 + 4 * 7;
// preamble_size(4) + firmware_version(4) + body_signature_algorithm(4)
//   + body_signature_len(4) + body_signature_offset(4)
const PREAMBLE_FIXED_SIZE: usize = 4 * 5;

#[derive(Debug, Error)]
pub enum VbootError {
    #[error("GBB section missing")]
    MissingGbb,
    #[error("GBB header invalid: {0}")]
    InvalidGbb(&'static str),
    #[error("more than one valid GBB header found in the blob")]
    MultipleGbbHeaders,
    #[error("section missing: {0}")]
    MissingSection(String),
    #[error("packed key invalid: {0}")]
    InvalidKey(&'static str),
    #[error("keyblock section too small for header + preamble")]
    KeyblockTooSmall,
    #[error("keyblock signature verification failed")]
    VerificationFailed,
}

pub type VbootResult<T> = Result<T, VbootError>;

/// A parsed, validated GBB header. Offsets are relative to
/// [`Gbb::section`]; callers index into the image with
/// `section.offset + field_offset`.
#[derive(Debug, Clone, Copy)]
pub struct Gbb {
    pub section: Section,
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: u32,
    pub hwid_offset: u32,
    pub hwid_size: u32,
    pub rootkey_offset: u32,
    pub rootkey_size: u32,
    pub bmpfv_offset: u32,
    pub bmpfv_size: u32,
    pub recovery_key_offset: u32,
    pub recovery_key_size: u32,
}

/// Locate and validate the `GBB` section in `image`.
///
/// Scans the section at a 4-byte stride for the signature and accepts the
/// blob only if exactly one valid header is found -- a second, apparently
/// valid header is evidence of a crafted or corrupted blob, not a format
/// this system will update.
pub fn find_gbb(image: &[u8], fmap: &FmapView) -> VbootResult<Gbb> {
    let section = fmap.find("GBB").ok_or(VbootError::MissingGbb)?;
    if !section.fits_within(image.len()) {
        return Err(VbootError::InvalidGbb("section out of bounds"));
    }
    let blob = section.slice(image);

    let mut found: Option<Gbb> = None;
    let mut offset = 0;
    while offset + GBB_SIGNATURE.len() <= blob.len() {
        if &blob[offset..offset + GBB_SIGNATURE.len()] == GBB_SIGNATURE {
            if let Ok(gbb) = parse_gbb_at(blob, offset, section) {
                if found.is_some() {
                    return Err(VbootError::MultipleGbbHeaders);
                }
                found = Some(gbb);
            }
        }
        offset += GBB_SCAN_STRIDE;
    }

    found.ok_or(VbootError::InvalidGbb("no valid GBB header found"))
}

fn parse_gbb_at(blob: &[u8], at: usize, section: Section) -> VbootResult<Gbb> {
    if at + GBB_HEADER_SIZE > blob.len() {
        return Err(VbootError::InvalidGbb("header would run past blob"));
    }
    let h = &blob[at..at + GBB_HEADER_SIZE];
    let major_version = u16::from_le_bytes(h[4..6].try_into().unwrap());
    let minor_version = u16::from_le_bytes(h[6..8].try_into().unwrap());
    let header_size = u32::from_le_bytes(h[8..12].try_into().unwrap());
    let flags = u32::from_le_bytes(h[12..16].try_into().unwrap());
    let hwid_offset = u32::from_le_bytes(h[16..20].try_into().unwrap());
    let hwid_size = u32::from_le_bytes(h[20..24].try_into().unwrap());
    let rootkey_offset = u32::from_le_bytes(h[24..28].try_into().unwrap());
    let rootkey_size = u32::from_le_bytes(h[28..32].try_into().unwrap());
    let bmpfv_offset = u32::from_le_bytes(h[32..36].try_into().unwrap());
    let bmpfv_size = u32::from_le_bytes(h[36..40].try_into().unwrap());
    let recovery_key_offset = u32::from_le_bytes(h[40..44].try_into().unwrap());
    let recovery_key_size = u32::from_le_bytes(h[44..48].try_into().unwrap());

    if major_version != GBB_SUPPORTED_MAJOR_VERSION {
        return Err(VbootError::InvalidGbb("unsupported major version"));
    }
    if header_size as usize != GBB_HEADER_SIZE || header_size as usize > blob.len() {
        return Err(VbootError::InvalidGbb("header size mismatch"));
    }

    for (off, size) in [
        (hwid_offset, hwid_size),
        (rootkey_offset, rootkey_size),
        (bmpfv_offset, bmpfv_size),
        (recovery_key_offset, recovery_key_size),
    ] {
        if off < header_size {
            return Err(VbootError::InvalidGbb("descriptor overlaps header"));
        }
        let end = (off as u64) + (size as u64);
        if end > blob.len() as u64 {
            return Err(VbootError::InvalidGbb("descriptor out of bounds"));
        }
    }

    let hwid_bytes = &blob[hwid_offset as usize..(hwid_offset + hwid_size) as usize];
    if !hwid_bytes.contains(&0) {
        return Err(VbootError::InvalidGbb("HWID is not NUL-terminated"));
    }

    Ok(Gbb {
        section,
        major_version,
        minor_version,
        header_size,
        flags,
        hwid_offset,
        hwid_size,
        rootkey_offset,
        rootkey_size,
        bmpfv_offset,
        bmpfv_size,
        recovery_key_offset,
        recovery_key_size,
    })
}

impl Gbb {
    pub fn hwid_range(&self) -> Section {
        Section {
            offset: self.section.offset + self.hwid_offset as usize,
            len: self.hwid_size as usize,
        }
    }

    pub fn rootkey_range(&self) -> Section {
        Section {
            offset: self.section.offset + self.rootkey_offset as usize,
            len: self.rootkey_size as usize,
        }
    }

    pub fn hwid_str(&self, image: &[u8]) -> String {
        nul_terminated_str(self.hwid_range().slice(image))
    }
}

/// A packed public key blob: an algorithm id, a `key_version`, and the RSA
/// material itself, length-prefixed inside the blob at `key_offset`.
///
/// Layout (all little-endian): `algorithm:u32, key_version:u32,
/// key_len:u32, key_offset:u32`, then at `key_offset` within the same
/// blob: `modulus_len:u32, modulus[modulus_len] (big-endian), exponent:u32
/// (big-endian)`.
#[derive(Debug, Clone)]
pub struct PackedKey {
    pub algorithm: u32,
    pub key_version: u32,
    pub bytes: Vec<u8>,
    key_offset: u32,
    key_len: u32,
}

const PACKED_KEY_HEADER_LEN: usize = 16;

impl PackedKey {
    pub fn parse(bytes: &[u8]) -> VbootResult<PackedKey> {
        if bytes.len() < PACKED_KEY_HEADER_LEN {
            return Err(VbootError::InvalidKey("blob shorter than header"));
        }
        let algorithm = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let key_version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let key_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let key_offset = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        let end = (key_offset as u64) + (key_len as u64);
        if key_len == 0 || end > bytes.len() as u64 {
            return Err(VbootError::InvalidKey("key material out of bounds"));
        }

        Ok(PackedKey {
            algorithm,
            key_version,
            bytes: bytes.to_vec(),
            key_offset,
            key_len,
        })
    }

    fn key_material(&self) -> &[u8] {
        &self.bytes[self.key_offset as usize..(self.key_offset + self.key_len) as usize]
    }

    pub fn to_rsa_public_key(&self) -> VbootResult<RsaPublicKey> {
        let material = self.key_material();
        if material.len() < 8 {
            return Err(VbootError::InvalidKey("key material too short"));
        }
        let modulus_len = u32::from_le_bytes(material[0..4].try_into().unwrap()) as usize;
        if material.len() < 4 + modulus_len + 4 {
            return Err(VbootError::InvalidKey("modulus/exponent truncated"));
        }
        let modulus = &material[4..4 + modulus_len];
        let exponent = &material[4 + modulus_len..4 + modulus_len + 4];

        let n = BigUint::from_bytes_be(modulus);
        let e = BigUint::from_bytes_be(exponent);
        RsaPublicKey::new(n, e).map_err(|_| VbootError::InvalidKey("not a valid RSA public key"))
    }

    /// SHA1 of the whole packed-key blob, used only as a human diagnostic
    /// when two root keys fail to compare equal.
    pub fn sha1_hex(&self) -> String {
        use sha1::{Digest, Sha1};
        let digest = Sha1::digest(&self.bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub fn get_rootkey(image: &[u8], gbb: &Gbb) -> VbootResult<PackedKey> {
    let range = gbb.rootkey_range();
    if !range.fits_within(image.len()) {
        return Err(VbootError::InvalidKey("root key range out of bounds"));
    }
    PackedKey::parse(range.slice(image))
}

/// A keyblock + firmware preamble pair found at the start of a vblock
/// section (e.g. `VBLOCK_A`).
#[derive(Debug, Clone)]
pub struct Keyblock {
    pub section: Section,
    pub data_key_version: u32,
    pub firmware_version: u32,
    data_key_offset: u32,
    data_key_len: u32,
    signature_offset: u32,
    signature_len: u32,
}

pub fn get_keyblock(image: &[u8], fmap: &FmapView, section_name: &str) -> VbootResult<Keyblock> {
    let section = fmap
        .find(section_name)
        .ok_or_else(|| VbootError::MissingSection(section_name.to_string()))?;
    if !section.fits_within(image.len()) {
        return Err(VbootError::InvalidGbb("vblock section out of bounds"));
    }
    if section.len < KEYBLOCK_FIXED_SIZE + PREAMBLE_FIXED_SIZE {
        return Err(VbootError::KeyblockTooSmall);
    }
    let blob = section.slice(image);
    if &blob[0..8] != KEYBLOCK_MAGIC {
        return Err(VbootError::InvalidGbb("keyblock magic mismatch"));
    }

    let data_key_version = u32::from_le_bytes(blob[16..20].try_into().unwrap());
    let data_key_len = u32::from_le_bytes(blob[20..24].try_into().unwrap());
    let data_key_offset = u32::from_le_bytes(blob[24..28].try_into().unwrap());
    let signature_len = u32::from_le_bytes(blob[32..36].try_into().unwrap());
    let signature_offset = u32::from_le_bytes(blob[36..40].try_into().unwrap());

    let keyblock_size = u32::from_le_bytes(blob[8..12].try_into().unwrap()) as usize;
    if keyblock_size > section.len {
        return Err(VbootError::InvalidGbb("keyblock_size exceeds section"));
    }
    let preamble = &blob[keyblock_size..];
    if preamble.len() < PREAMBLE_FIXED_SIZE {
        return Err(VbootError::KeyblockTooSmall);
    }
    let firmware_version = u32::from_le_bytes(preamble[4..8].try_into().unwrap());

    Ok(Keyblock {
        section,
        data_key_version,
        firmware_version,
        data_key_offset,
        data_key_len,
        signature_offset,
        signature_len,
    })
}

/// Verify `keyblock`'s signature against `key`.
///
/// Takes a byte-identical copy of the keyblock rather than borrowing the
/// live image: some native RSA verifiers use their input as scratch space,
/// and running verification against a private copy keeps the operation
/// idempotent regardless of what the verifier does to it.
pub fn verify_keyblock(keyblock_bytes: &[u8], keyblock: &Keyblock, key: &PackedKey) -> VbootResult<()> {
    let data_key_end = (keyblock.data_key_offset + keyblock.data_key_len) as usize;
    let sig_end = (keyblock.signature_offset + keyblock.signature_len) as usize;
    if data_key_end > keyblock_bytes.len() || sig_end > keyblock_bytes.len() {
        return Err(VbootError::KeyblockTooSmall);
    }

    let signed_region = &keyblock_bytes[0..data_key_end];
    let signature_bytes =
        &keyblock_bytes[keyblock.signature_offset as usize..sig_end];

    let pubkey = key.to_rsa_public_key()?;
    let verifying_key = VerifyingKey::<Sha256>::new(pubkey);
    let signature = Signature::try_from(signature_bytes)
        .map_err(|_| VbootError::VerificationFailed)?;

    verifying_key
        .verify(signed_region, &signature)
        .map_err(|_| VbootError::VerificationFailed)
}

pub fn get_key_versions(image: &[u8], fmap: &FmapView, section: &str) -> VbootResult<(u32, u32)> {
    let kb = get_keyblock(image, fmap, section)?;
    Ok((kb.data_key_version, kb.firmware_version))
}

/// Read a NUL-padded ASCII firmware identifier from `section`.
pub fn load_firmware_version(image: &[u8], fmap: &FmapView, section: &str) -> Option<String> {
    let range = fmap.find(section)?;
    if !range.fits_within(image.len()) {
        return None;
    }
    Some(nul_terminated_str(range.slice(image)))
}
