#![deny(unsafe_code)]
//! Probe image headers for format and pixel dimensions without decoding.
//!
//! Given a raw byte buffer (and an optionally-unreliable declared MIME
//! type), this crate determines the pixel width and height of the image
//! from its header bytes alone. Six container families are understood:
//! PNG, GIF, JPEG, WebP, BMP, and the ISO Base Media File Format family
//! used by AVIF/HEIC/HEIF.
//!
//! Everything here is pure and synchronous: the caller supplies the whole
//! buffer, nothing is decoded, and every multi-byte read is bounds-checked
//! so truncated or adversarial input can only ever produce `None`.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use arrayvec::ArrayVec;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use fallible_collections::TryReserveError;
use log::{debug, warn};

use std::borrow::Cow;
use std::fmt;

mod bmff;
mod boxes;
mod raster;

use crate::boxes::FourCC;

/// Describes parser failures.
///
/// Never escapes the crate: the public functions collapse every failure to
/// `None`, because a wrong non-null answer is worse than no answer.
#[derive(Debug)]
pub(crate) enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// A read would have run past the end of the buffer.
    UnexpectedEOF,
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::UnexpectedEOF => "EOF",
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Width and height of an image in pixels.
///
/// Both fields are strictly positive: a header that would report a zero or
/// negative extent is treated as malformed, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDimensions {
    pub width: u32,
    pub height: u32,
}

impl PixelDimensions {
    pub(crate) fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("image dimensions cannot be zero"));
        }
        Ok(Self { width, height })
    }
}

/// The raster formats this crate can probe.
///
/// Closed set; the canonical MIME string for each is available through
/// [`ImageFormat::mime_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Gif,
    Jpeg,
    WebP,
    Bmp,
    Avif,
    Heic,
    Heif,
}

impl ImageFormat {
    /// The canonical MIME type for this format.
    pub const fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Avif => "image/avif",
            Self::Heic => "image/heic",
            Self::Heif => "image/heif",
        }
    }

    /// Map a canonical MIME type onto a format.
    ///
    /// Expects [`normalize_mime`] output; vendor aliases like `image/jpg`
    /// are not recognized here.
    pub fn from_mime(mime: &str) -> Option<Self> {
        Some(match mime {
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "image/jpeg" => Self::Jpeg,
            "image/webp" => Self::WebP,
            "image/bmp" => Self::Bmp,
            "image/avif" => Self::Avif,
            "image/heic" => Self::Heic,
            "image/heif" => Self::Heif,
            _ => return None,
        })
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Rewrite vendor and legacy MIME aliases onto their canonical spelling.
///
/// Trims and ASCII-lowercases the input; unknown types pass through
/// unchanged apart from that. Total function, no failure mode.
///
/// ```
/// assert_eq!(zenprobe::normalize_mime(" Image/JPG "), "image/jpeg");
/// assert_eq!(zenprobe::normalize_mime("image/apng"), "image/png");
/// assert_eq!(zenprobe::normalize_mime("text/plain"), "text/plain");
/// ```
pub fn normalize_mime(mime: &str) -> Cow<'_, str> {
    let trimmed = mime.trim();
    let lowered: Cow<'_, str> = if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    };
    match lowered.as_ref() {
        "image/jpg" | "image/pjpeg" => Cow::Borrowed("image/jpeg"),
        "image/x-webp" => Cow::Borrowed("image/webp"),
        "image/x-png" | "image/apng" => Cow::Borrowed("image/png"),
        "image/x-ms-bmp" | "image/x-bmp" => Cow::Borrowed("image/bmp"),
        "image/svg" => Cow::Borrowed("image/svg+xml"),
        _ => lowered,
    }
}

/// Brand entries examined in an `ftyp` box before giving up.
const MAX_BRANDS: usize = 32;

/// Sniff the format from the buffer's leading bytes, ignoring any declared
/// type.
///
/// ISOBMFF containers are classified by their `ftyp` brands; everything
/// else by byte signature.
///
/// ```
/// use zenprobe::ImageFormat;
/// let png_sig = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
/// assert_eq!(zenprobe::detect_format(&png_sig), Some(ImageFormat::Png));
/// assert_eq!(zenprobe::detect_format(b"not an image"), None);
/// ```
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    if let Some(format) = detect_bmff_brand(data) {
        return Some(format);
    }
    if tag_at(data, 0, &raster::PNG_SIGNATURE) {
        return Some(ImageFormat::Png);
    }
    if tag_at(data, 0, b"GIF") {
        return Some(ImageFormat::Gif);
    }
    if tag_at(data, 0, &[0xFF, 0xD8, 0xFF]) {
        return Some(ImageFormat::Jpeg);
    }
    if tag_at(data, 0, b"BM") {
        return Some(ImageFormat::Bmp);
    }
    if tag_at(data, 0, b"RIFF") && tag_at(data, 8, b"WEBP") && tag_at(data, 12, b"VP8") {
        return Some(ImageFormat::WebP);
    }
    None
}

/// Classify an ISOBMFF buffer by the brands in its leading `ftyp` box.
///
/// See ISO 14496-12:2015 § 4.3. Returns `None` both for non-ISOBMFF input
/// and for `ftyp` boxes carrying no brand we know, so the caller can fall
/// through to the plain signature checks.
fn detect_bmff_brand(data: &[u8]) -> Option<ImageFormat> {
    if data.len() < 16 || !tag_at(data, 4, b"ftyp") {
        return None;
    }
    let size32 = be_u32(data, 0).ok()?;
    let (header, size) = match size32 {
        0 => (8u64, data.len() as u64),
        1 => (16u64, be_u64(data, 8).ok()?),
        _ => (8u64, u64::from(size32)),
    };
    // The box must at least hold its major brand and minor version.
    if size < header + 8 || size > data.len() as u64 {
        return None;
    }
    let box_end = size as usize;
    let header = header as usize;

    let mut brands = ArrayVec::<FourCC, MAX_BRANDS>::new();
    brands.push(FourCC::read(data, header)?);
    // Compatible brands follow the 4-byte minor version.
    let mut at = header + 8;
    while at + 4 <= box_end && !brands.is_full() {
        brands.push(FourCC::read(data, at)?);
        at += 4;
    }

    let any = |tags: &[FourCC]| brands.iter().any(|b| tags.contains(b));
    if any(&[FourCC::AVIF, FourCC::AVIS]) {
        Some(ImageFormat::Avif)
    } else if any(&[FourCC::HEIC, FourCC::HEIX, FourCC::HEVC, FourCC::HEVX]) {
        Some(ImageFormat::Heic)
    } else if any(&[FourCC::MIF1, FourCC::MSF1]) {
        Some(ImageFormat::Heif)
    } else {
        None
    }
}

/// Extract pixel dimensions from an image buffer.
///
/// The declared MIME type is tried first, but it is only a hint: renamed
/// files and mislabeled attachments are common, so when the declared type
/// fails to parse, the buffer is re-sniffed and the detected format gets
/// one retry. Returns `None` when neither attempt yields dimensions.
///
/// ```
/// let gif = *b"GIF89a\x40\x01\xf0\x00\x00\x00\x00\x00";
/// let dim = zenprobe::image_dimensions(&gif, "image/gif").unwrap();
/// assert_eq!((dim.width, dim.height), (320, 240));
/// ```
pub fn image_dimensions(data: &[u8], declared_mime: &str) -> Option<PixelDimensions> {
    let normalized = normalize_mime(declared_mime);
    let declared = ImageFormat::from_mime(&normalized);
    if let Some(format) = declared {
        match extract(format, data) {
            Ok(dim) => return Some(dim),
            Err(err) => debug!("{format} extraction failed ({err}), re-sniffing"),
        }
    }
    let sniffed = detect_format(data)?;
    if declared == Some(sniffed) {
        return None;
    }
    if declared.is_some() {
        warn!("buffer declared as {normalized} sniffs as {sniffed}");
    }
    extract(sniffed, data).ok()
}

/// Extract pixel dimensions for a buffer already known to be `format`.
///
/// No sniffing and no fallback; use [`image_dimensions`] when the format
/// is only a claim.
pub fn image_dimensions_for(format: ImageFormat, data: &[u8]) -> Option<PixelDimensions> {
    extract(format, data).ok()
}

fn extract(format: ImageFormat, data: &[u8]) -> Result<PixelDimensions> {
    match format {
        ImageFormat::Png => raster::read_png(data),
        ImageFormat::Gif => raster::read_gif(data),
        ImageFormat::Jpeg => raster::read_jpeg(data),
        ImageFormat::WebP => raster::read_webp(data),
        ImageFormat::Bmp => raster::read_bmp(data),
        ImageFormat::Avif | ImageFormat::Heic | ImageFormat::Heif => bmff::largest_extents(data),
    }
}

/// True when `buf` holds exactly `tag` at offset `at`.
pub(crate) fn tag_at(buf: &[u8], at: usize, tag: &[u8]) -> bool {
    at.checked_add(tag.len())
        .is_some_and(|end| buf.get(at..end) == Some(tag))
}

fn field(buf: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    let end = at.checked_add(len).ok_or(Error::UnexpectedEOF)?;
    buf.get(at..end).ok_or(Error::UnexpectedEOF)
}

pub(crate) fn be_u16(buf: &[u8], at: usize) -> Result<u16> {
    Ok(BigEndian::read_u16(field(buf, at, 2)?))
}

pub(crate) fn be_u32(buf: &[u8], at: usize) -> Result<u32> {
    Ok(BigEndian::read_u32(field(buf, at, 4)?))
}

pub(crate) fn be_u64(buf: &[u8], at: usize) -> Result<u64> {
    Ok(BigEndian::read_u64(field(buf, at, 8)?))
}

pub(crate) fn le_u16(buf: &[u8], at: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(field(buf, at, 2)?))
}

pub(crate) fn le_u24(buf: &[u8], at: usize) -> Result<u32> {
    Ok(LittleEndian::read_u24(field(buf, at, 3)?))
}

pub(crate) fn le_u32(buf: &[u8], at: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(field(buf, at, 4)?))
}

#[test]
fn reads_are_bounds_checked() {
    let buf = [1u8, 2, 3, 4];
    assert!(be_u32(&buf, 0).is_ok());
    assert!(be_u32(&buf, 1).is_err());
    assert!(be_u64(&buf, 0).is_err());
    assert!(le_u16(&buf, usize::MAX).is_err());
    assert!(!tag_at(&buf, usize::MAX, b"ab"));
    assert!(tag_at(&buf, 2, &[3, 4]));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_aliases() {
        assert_eq!(normalize_mime("image/jpg"), "image/jpeg");
        assert_eq!(normalize_mime("image/pjpeg"), "image/jpeg");
        assert_eq!(normalize_mime("image/x-webp"), "image/webp");
        assert_eq!(normalize_mime("image/x-png"), "image/png");
        assert_eq!(normalize_mime("image/apng"), "image/png");
        assert_eq!(normalize_mime("image/x-ms-bmp"), "image/bmp");
        assert_eq!(normalize_mime("image/x-bmp"), "image/bmp");
        assert_eq!(normalize_mime("image/svg"), "image/svg+xml");
    }

    #[test]
    fn normalize_passes_unknown_through() {
        assert_eq!(normalize_mime("image/heic"), "image/heic");
        assert_eq!(normalize_mime("  IMAGE/HEIC  "), "image/heic");
        assert_eq!(normalize_mime("application/octet-stream"), "application/octet-stream");
        assert_eq!(normalize_mime(""), "");
    }

    #[test]
    fn normalize_borrows_when_already_canonical() {
        assert!(matches!(normalize_mime("image/png"), Cow::Borrowed(_)));
        assert!(matches!(normalize_mime("Image/PNG"), Cow::Owned(_)));
    }

    #[test]
    fn format_mime_round_trip() {
        for format in [
            ImageFormat::Png,
            ImageFormat::Gif,
            ImageFormat::Jpeg,
            ImageFormat::WebP,
            ImageFormat::Bmp,
            ImageFormat::Avif,
            ImageFormat::Heic,
            ImageFormat::Heif,
        ] {
            assert_eq!(ImageFormat::from_mime(format.mime_type()), Some(format));
        }
        assert_eq!(ImageFormat::from_mime("image/jpg"), None);
    }

    #[test]
    fn detect_rejects_short_and_junk_buffers() {
        assert_eq!(detect_format(&[]), None);
        assert_eq!(detect_format(&[0x89]), None);
        assert_eq!(detect_format(b"RIFF\x00\x00\x00\x00WAVEfmt "), None);
        assert_eq!(detect_format(&[0u8; 64]), None);
    }

    #[test]
    fn detect_classifies_signatures() {
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(detect_format(b"GIF87a"), Some(ImageFormat::Gif));
        assert_eq!(detect_format(b"BM\x00\x00"), Some(ImageFormat::Bmp));
        assert_eq!(
            detect_format(b"RIFF\x24\x00\x00\x00WEBPVP8 "),
            Some(ImageFormat::WebP)
        );
    }

    fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
        let size = 16 + 4 * compatible.len() as u32;
        let mut buf = size.to_be_bytes().to_vec();
        buf.extend_from_slice(b"ftyp");
        buf.extend_from_slice(major);
        buf.extend_from_slice(&0u32.to_be_bytes());
        for brand in compatible {
            buf.extend_from_slice(*brand);
        }
        buf
    }

    #[test]
    fn detect_classifies_bmff_brands() {
        assert_eq!(detect_format(&ftyp(b"avif", &[])), Some(ImageFormat::Avif));
        assert_eq!(detect_format(&ftyp(b"avis", &[])), Some(ImageFormat::Avif));
        assert_eq!(detect_format(&ftyp(b"heic", &[])), Some(ImageFormat::Heic));
        assert_eq!(detect_format(&ftyp(b"mif1", &[])), Some(ImageFormat::Heif));
        // avif wins over heic regardless of position
        assert_eq!(
            detect_format(&ftyp(b"heic", &[b"avif"])),
            Some(ImageFormat::Avif)
        );
        // compatible brand alone is enough
        assert_eq!(
            detect_format(&ftyp(b"isom", &[b"mif1"])),
            Some(ImageFormat::Heif)
        );
        // unknown brands fall through to signature checks and fail
        assert_eq!(detect_format(&ftyp(b"isom", &[b"mp42"])), None);
    }

    #[test]
    fn detect_rejects_malformed_ftyp_sizes() {
        let mut buf = ftyp(b"avif", &[]);
        // size larger than the buffer
        buf[0..4].copy_from_slice(&1000u32.to_be_bytes());
        assert_eq!(detect_format(&buf), None);
        // size smaller than header + brands
        buf[0..4].copy_from_slice(&9u32.to_be_bytes());
        assert_eq!(detect_format(&buf), None);
    }

    #[test]
    fn detect_handles_size_escapes_in_ftyp() {
        // size=0: box runs to the end of the buffer
        let mut buf = ftyp(b"avif", &[]);
        buf[0..4].copy_from_slice(&0u32.to_be_bytes());
        assert_eq!(detect_format(&buf), Some(ImageFormat::Avif));

        // size=1: 64-bit size follows the box type
        let mut large = Vec::new();
        large.extend_from_slice(&1u32.to_be_bytes());
        large.extend_from_slice(b"ftyp");
        large.extend_from_slice(&28u64.to_be_bytes());
        large.extend_from_slice(b"heic");
        large.extend_from_slice(&0u32.to_be_bytes());
        large.extend_from_slice(b"mif1");
        assert_eq!(detect_format(&large), Some(ImageFormat::Heic));
    }

    #[test]
    fn dispatcher_trusts_declared_type_first() {
        let gif = *b"GIF89a\x40\x01\xf0\x00\x00\x00\x00\x00";
        let dim = image_dimensions(&gif, "image/gif").unwrap();
        assert_eq!(dim, PixelDimensions { width: 320, height: 240 });
    }

    #[test]
    fn dispatcher_recovers_from_wrong_declared_type() {
        let gif = *b"GIF89a\x40\x01\xf0\x00\x00\x00\x00\x00";
        for declared in ["image/png", "image/jpg", "application/octet-stream", ""] {
            let dim = image_dimensions(&gif, declared).unwrap();
            assert_eq!(dim, PixelDimensions { width: 320, height: 240 });
        }
    }

    #[test]
    fn dispatcher_gives_up_when_sniff_matches_declared() {
        // Valid GIF signature but truncated descriptor: the gif parser
        // fails, the sniffer still says gif, and there is no second try.
        let gif = *b"GIF89a\x40";
        assert_eq!(image_dimensions(&gif, "image/gif"), None);
    }

    #[test]
    fn dispatcher_returns_none_for_unrecognized_buffers() {
        assert_eq!(image_dimensions(b"hello world", "image/png"), None);
        assert_eq!(image_dimensions(&[], "image/png"), None);
    }
}
