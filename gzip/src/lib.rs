//! gzip (RFC 1952) member container parsing for the boot ramdisk.
//!
//! A member is a 10-byte header, optional extra/name/comment/header-CRC
//! fields, a DEFLATE payload, and a trailing CRC32 + uncompressed-size pair.
//! The payload itself is handed to the `inflate` crate; this crate only
//! validates the container around it.
//!
//! Multi-member concatenation is a caller concern: [`decompress_into`]
//! handles one member and reports where it ended.
#![no_std]

use inflate::{inflate_into, InflateError, StreamPosition};

/// Container error definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GzipError {
    /// The magic bytes or a reserved flag bit are wrong.
    InvalidHeader,
    /// The compression-method byte names something other than DEFLATE.
    UnsupportedMethod,
    /// The member ends before its header fields, payload, or trailer do.
    TruncatedMember,
    /// The CRC32 trailer does not match the decompressed output.
    ChecksumMismatch,
    /// The `ISIZE` trailer does not match the decompressed size, or the
    /// output buffer was too small to hold the member.
    SizeMismatch,
    /// The DEFLATE payload itself is malformed.
    Inflate(InflateError),
}

impl From<InflateError> for GzipError {
    fn from(err: InflateError) -> Self {
        GzipError::Inflate(err)
    }
}

/// Where a successfully decoded member ended, and what it held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSummary {
    /// Decompressed payload size in bytes.
    pub written: usize,
    /// Offset of the first byte past this member's trailer.
    pub end_offset: usize,
}

const MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;
const HEADER_LEN: usize = 10;
const TRAILER_LEN: usize = 8;

//FLG bits, RFC 1952 section 2.3.1. FTEXT (0x01) is a hint and needs no
//handling here.
const FLAG_HEADER_CRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;
const FLAG_RESERVED: u8 = 0xe0;

/// Decompress the single gzip member at the start of `src` into `dst`,
/// validating the trailing CRC32 and size fields against the output.
///
/// `dst` must be at least as large as the member's decompressed size; use
/// [`uncompressed_size`] to read that size from the trailer beforehand.
pub fn decompress_into(src: &[u8], dst: &mut [u8]) -> Result<MemberSummary, GzipError> {
    let payload = payload_offset(src)?;

    let mut position = StreamPosition::at_byte(payload);
    let summary = inflate_into(src, &mut position, dst)?;

    // the final block usually ends mid-byte; the trailer begins at the next
    // byte boundary.
    let trailer = position.byte_offset + (position.bit_offset != 0) as usize;
    let Some(raw) = src.get(trailer..trailer + TRAILER_LEN) else {
        return Err(GzipError::TruncatedMember);
    };
    let expected_crc = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let expected_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;

    if summary.truncated || summary.written != expected_size {
        Err(GzipError::SizeMismatch)?;
    }
    if crc32(&dst[..summary.written]) != expected_crc {
        Err(GzipError::ChecksumMismatch)?;
    }

    log::debug!("gzip member: {} compressed bytes -> {} bytes", trailer + TRAILER_LEN, summary.written);
    Ok(MemberSummary { written: summary.written, end_offset: trailer + TRAILER_LEN })
}

/// Read the decompressed size recorded in the member trailer, for sizing the
/// output buffer before calling [`decompress_into`].
///
/// `ISIZE` is the size modulo 2^32; ramdisk images are comfortably below
/// that.
pub fn uncompressed_size(src: &[u8]) -> Result<usize, GzipError> {
    if src.len() < HEADER_LEN + TRAILER_LEN {
        Err(GzipError::TruncatedMember)?;
    }
    let raw = &src[src.len() - 4..];
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
}

// Validates the fixed header and skips the optional fields, returning the
// offset of the DEFLATE payload.
fn payload_offset(src: &[u8]) -> Result<usize, GzipError> {
    if src.len() < HEADER_LEN {
        Err(GzipError::TruncatedMember)?;
    }
    if src[0..2] != MAGIC {
        Err(GzipError::InvalidHeader)?;
    }
    if src[2] != METHOD_DEFLATE {
        Err(GzipError::UnsupportedMethod)?;
    }
    let flags = src[3];
    if flags & FLAG_RESERVED != 0 {
        Err(GzipError::InvalidHeader)?;
    }
    // MTIME, XFL, and OS occupy the rest of the fixed header; nothing in
    // them affects decoding.
    log::debug!("gzip header: flags={:#04x}", flags);

    let mut offset = HEADER_LEN;
    if flags & FLAG_EXTRA != 0 {
        let Some(raw) = src.get(offset..offset + 2) else {
            return Err(GzipError::TruncatedMember);
        };
        let extra_len = u16::from_le_bytes([raw[0], raw[1]]) as usize;
        offset += 2 + extra_len;
        if offset > src.len() {
            Err(GzipError::TruncatedMember)?;
        }
    }
    if flags & FLAG_NAME != 0 {
        offset = skip_zero_terminated(src, offset)?;
    }
    if flags & FLAG_COMMENT != 0 {
        offset = skip_zero_terminated(src, offset)?;
    }
    if flags & FLAG_HEADER_CRC != 0 {
        offset += 2;
        if offset > src.len() {
            Err(GzipError::TruncatedMember)?;
        }
    }
    Ok(offset)
}

fn skip_zero_terminated(src: &[u8], offset: usize) -> Result<usize, GzipError> {
    match src[offset..].iter().position(|&byte| byte == 0) {
        Some(end) => Ok(offset + end + 1),
        None => Err(GzipError::TruncatedMember),
    }
}

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut value = index as u32;
        let mut round = 0;
        while round < 8 {
            value = if value & 1 != 0 { 0xEDB8_8320 ^ (value >> 1) } else { value >> 1 };
            round += 1;
        }
        table[index] = value;
        index += 1;
    }
    table
}

/// CRC32 (IEEE, reflected) over `data`, as used by the gzip trailer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut state = 0xFFFF_FFFFu32;
    for &byte in data {
        state = CRC_TABLE[((state ^ byte as u32) & 0xff) as usize] ^ (state >> 8);
    }
    !state
}

#[cfg(test)]
mod test {
    extern crate std;
    use std::{vec, vec::Vec};

    use miniz_oxide::deflate::compress_to_vec;

    use super::*;

    // Builds a well-formed single-member stream around a miniz payload.
    fn member(data: &[u8], name: Option<&[u8]>, extra: Option<&[u8]>) -> Vec<u8> {
        let mut flags = 0u8;
        if name.is_some() {
            flags |= FLAG_NAME;
        }
        if extra.is_some() {
            flags |= FLAG_EXTRA;
        }
        let mut out = vec![0x1f, 0x8b, 0x08, flags, 0, 0, 0, 0, 0, 0xff];
        if let Some(extra) = extra {
            out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            out.extend_from_slice(extra);
        }
        if let Some(name) = name {
            out.extend_from_slice(name);
            out.push(0);
        }
        out.extend_from_slice(&compress_to_vec(data, 6));
        out.extend_from_slice(&crc32(data).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out
    }

    #[test]
    fn crc32_should_match_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn member_should_round_trip() {
        let data = b"initial ramdisk image contents, repeated contents, contents";
        let src = member(data, None, None);
        let mut output = vec![0u8; uncompressed_size(&src).unwrap()];
        let summary = decompress_into(&src, &mut output).unwrap();
        assert_eq!(summary, MemberSummary { written: data.len(), end_offset: src.len() });
        assert_eq!(&output[..], &data[..]);
    }

    #[test]
    fn optional_header_fields_should_be_skipped() {
        let data = b"payload behind optional fields";
        let src = member(data, Some(b"ramdisk.img"), Some(b"\x01\x02\x03\x04"));
        let mut output = vec![0u8; data.len()];
        let summary = decompress_into(&src, &mut output).unwrap();
        assert_eq!(summary.written, data.len());
        assert_eq!(&output[..], &data[..]);
    }

    #[test]
    fn bad_magic_should_fail() {
        let mut src = member(b"data", None, None);
        src[1] = 0x8c;
        assert_eq!(decompress_into(&src, &mut [0u8; 4]), Err(GzipError::InvalidHeader));
    }

    #[test]
    fn unsupported_method_should_fail() {
        let mut src = member(b"data", None, None);
        src[2] = 9;
        assert_eq!(decompress_into(&src, &mut [0u8; 4]), Err(GzipError::UnsupportedMethod));
    }

    #[test]
    fn corrupt_checksum_should_fail() {
        let mut src = member(b"checksummed data", None, None);
        let crc_offset = src.len() - 8;
        src[crc_offset] ^= 0xff;
        assert_eq!(decompress_into(&src, &mut [0u8; 16]), Err(GzipError::ChecksumMismatch));
    }

    #[test]
    fn wrong_trailer_size_should_fail() {
        let mut src = member(b"sized data", None, None);
        let size_offset = src.len() - 4;
        src[size_offset] ^= 0x01;
        assert_eq!(decompress_into(&src, &mut [0u8; 10]), Err(GzipError::SizeMismatch));
    }

    #[test]
    fn undersized_output_should_fail() {
        let data = b"does not fit in the buffer";
        let src = member(data, None, None);
        assert_eq!(decompress_into(&src, &mut [0u8; 4]), Err(GzipError::SizeMismatch));
    }

    #[test]
    fn truncated_member_should_fail() {
        let src = member(b"cut short", None, None);
        assert_eq!(decompress_into(&src[..8], &mut [0u8; 9]), Err(GzipError::TruncatedMember));
        // losing part of the trailer is detected even when the payload
        // decodes.
        let result = decompress_into(&src[..src.len() - 3], &mut [0u8; 9]);
        assert_eq!(result, Err(GzipError::TruncatedMember));
    }

    #[test]
    fn corrupt_payload_should_surface_inflate_error() {
        let src = member(b"", None, None);
        // BTYPE=3 directly after the header.
        let mut src = src[..HEADER_LEN].to_vec();
        src.push(0x07);
        src.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            decompress_into(&src, &mut [0u8; 4]),
            Err(GzipError::Inflate(InflateError::InvalidEncoding))
        );
    }

    #[test]
    fn uncompressed_size_should_read_trailer() {
        let data = vec![7u8; 12345];
        let src = member(&data, None, None);
        assert_eq!(uncompressed_size(&src), Ok(12345));
        assert_eq!(uncompressed_size(&src[..10]), Err(GzipError::TruncatedMember));
    }
}
