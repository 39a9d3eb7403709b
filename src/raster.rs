// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout raster headers: PNG, GIF, JPEG, WebP, BMP.
//!
//! Pure byte parsing over explicit offsets; each parser validates its
//! signature itself, so a caller-supplied format claim is never trusted.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;

use crate::{Error, PixelDimensions, Result, be_u16, be_u32, le_u16, le_u24, le_u32, tag_at};

pub(crate) const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Read PNG dimensions from the IHDR chunk.
///
/// iOS-optimized ("fried") PNGs insert a private `CgBI` chunk ahead of
/// IHDR; its 12 bytes of chunk framing plus its payload are skipped to
/// find where IHDR really starts.
pub(crate) fn read_png(data: &[u8]) -> Result<PixelDimensions> {
    if data.len() < 24 || !tag_at(data, 0, &PNG_SIGNATURE) {
        return Err(Error::InvalidData("missing PNG signature"));
    }
    let ihdr = if tag_at(data, 12, b"CgBI") {
        let cgbi_len = be_u32(data, 8)? as usize;
        8usize
            .checked_add(12)
            .and_then(|skip| skip.checked_add(cgbi_len))
            .ok_or(Error::InvalidData("CgBI length overflow"))?
    } else {
        8
    };
    // chunk length + type + width + height
    if ihdr.checked_add(16).is_none_or(|end| end > data.len()) {
        return Err(Error::UnexpectedEOF);
    }
    if !tag_at(data, ihdr + 4, b"IHDR") {
        return Err(Error::InvalidData("IHDR chunk not where expected"));
    }
    let width = be_u32(data, ihdr + 8)?;
    let height = be_u32(data, ihdr + 12)?;
    PixelDimensions::new(width, height)
}

/// Read GIF dimensions from the Logical Screen Descriptor.
pub(crate) fn read_gif(data: &[u8]) -> Result<PixelDimensions> {
    if data.len() < 10 || !tag_at(data, 0, b"GIF") {
        return Err(Error::InvalidData("missing GIF header"));
    }
    // GIF87a or GIF89a
    if data[3] != b'8' || !matches!(data[4], b'7' | b'9') || data[5] != b'a' {
        return Err(Error::Unsupported("unknown GIF version"));
    }
    let width = u32::from(le_u16(data, 6)?);
    let height = u32::from(le_u16(data, 8)?);
    PixelDimensions::new(width, height)
}

fn is_sof(marker: u8) -> bool {
    // every SOF variant except DHT (C4), JPG (C8) and DAC (CC)
    matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF)
}

/// Scan JPEG marker segments for the first Start-Of-Frame, correcting for
/// the EXIF orientation tag when one is present.
///
/// A malformed segment ends the scan with whatever was already found;
/// orientation trouble never fails the extraction, it only skips the swap.
pub(crate) fn read_jpeg(data: &[u8]) -> Result<PixelDimensions> {
    if data.len() < 4 || !tag_at(data, 0, &[0xFF, 0xD8]) {
        return Err(Error::InvalidData("missing SOI marker"));
    }
    let mut at = 2usize;
    let mut frame: Option<(u32, u32)> = None;
    let mut orientation: Option<u16> = None;
    let mut app1_seen = false;

    while at + 1 < data.len() {
        if frame.is_some() && app1_seen {
            break;
        }
        if data[at] != 0xFF {
            break; // lost marker sync
        }
        while at + 1 < data.len() && data[at + 1] == 0xFF {
            at += 1; // fill bytes
        }
        if at + 1 >= data.len() {
            break;
        }
        let marker = data[at + 1];
        at += 2;
        match marker {
            // EOI and SOS: nothing after these helps us
            0xD9 | 0xDA => break,
            // SOI, TEM and RSTn stand alone, no length field
            0xD8 | 0x01 | 0xD0..=0xD7 => continue,
            _ => {},
        }
        let Ok(length) = be_u16(data, at) else { break };
        let length = usize::from(length);
        // the length field counts itself
        if length < 2 {
            break;
        }
        let Some(segment_end) = at.checked_add(length) else { break };
        if segment_end > data.len() {
            break;
        }
        if is_sof(marker) && frame.is_none() {
            // length, then precision (1), height (2), width (2)
            if at + 7 > segment_end {
                break;
            }
            let height = be_u16(data, at + 3)?;
            let width = be_u16(data, at + 5)?;
            frame = Some((u32::from(width), u32::from(height)));
        } else if marker == 0xE1 && !app1_seen {
            // only the first APP1 is inspected
            app1_seen = true;
            orientation = exif_orientation(&data[at + 2..segment_end]);
            if orientation.is_none() {
                debug!("APP1 segment without a usable orientation tag");
            }
        }
        at = segment_end;
    }

    let (width, height) = frame.ok_or(Error::InvalidData("no SOF marker before scan data"))?;
    match orientation {
        // 5 through 8 are the four 90-degree-rotated variants
        Some(5..=8) => PixelDimensions::new(height, width),
        _ => PixelDimensions::new(width, height),
    }
}

/// TIFF IFD reads switch endianness on the header's byte-order mark.
struct TiffBytes<'a> {
    data: &'a [u8],
    little_endian: bool,
}

impl TiffBytes<'_> {
    fn u16_at(&self, at: usize) -> Option<u16> {
        let bytes = self.data.get(at..at.checked_add(2)?)?;
        Some(if self.little_endian {
            LittleEndian::read_u16(bytes)
        } else {
            BigEndian::read_u16(bytes)
        })
    }

    fn u32_at(&self, at: usize) -> Option<u32> {
        let bytes = self.data.get(at..at.checked_add(4)?)?;
        Some(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }
}

/// Pull the orientation out of an APP1 payload: `Exif\0\0`, a TIFF header,
/// then IFD0 entries scanned for tag 0x0112 (type SHORT, count 1).
///
/// Any structural deviation yields `None`; the caller proceeds without an
/// orientation correction.
fn exif_orientation(payload: &[u8]) -> Option<u16> {
    let tiff = payload.strip_prefix(b"Exif\0\0")?;
    let tiff = TiffBytes {
        data: tiff,
        little_endian: match tiff.get(..2)? {
            b"II" => true,
            b"MM" => false,
            _ => return None,
        },
    };
    if tiff.u16_at(2)? != 42 {
        return None;
    }
    let ifd = usize::try_from(tiff.u32_at(4)?).ok()?;
    let entries = usize::from(tiff.u16_at(ifd)?);
    for index in 0..entries {
        let entry = ifd.checked_add(2)?.checked_add(index.checked_mul(12)?)?;
        if tiff.u16_at(entry)? != 0x0112 {
            continue;
        }
        // SHORT with a count of one; the value rides in the offset field
        if tiff.u16_at(entry.checked_add(2)?)? != 3 || tiff.u32_at(entry.checked_add(4)?)? != 1 {
            return None;
        }
        let value = tiff.u16_at(entry.checked_add(8)?)?;
        return (1..=8).contains(&value).then_some(value);
    }
    None
}

/// Read WebP dimensions by walking the RIFF sub-chunks.
///
/// The first chunk that parses wins: `VP8 ` (lossy), `VP8L` (lossless) or
/// `VP8X` (extended/animated canvas). Chunks that fail to parse are
/// stepped over by their padded size.
pub(crate) fn read_webp(data: &[u8]) -> Result<PixelDimensions> {
    if data.len() < 20 || !tag_at(data, 0, b"RIFF") || !tag_at(data, 8, b"WEBP") {
        return Err(Error::InvalidData("missing RIFF/WEBP preamble"));
    }
    let mut at = 12usize;
    loop {
        if at.checked_add(8).is_none_or(|header_end| header_end > data.len()) {
            return Err(Error::UnexpectedEOF);
        }
        let size = le_u32(data, at + 4)? as usize;
        let payload = at + 8;
        let parsed = if tag_at(data, at, b"VP8 ") {
            read_vp8_frame(data, payload)
        } else if tag_at(data, at, b"VP8L") {
            read_vp8l_frame(data, payload)
        } else if tag_at(data, at, b"VP8X") {
            read_vp8x_canvas(data, payload)
        } else {
            Err(Error::Unsupported("uninteresting RIFF chunk"))
        };
        if let Ok(dim) = parsed {
            return Ok(dim);
        }
        // chunk payloads are padded to even length
        let padded = size
            .checked_add(size & 1)
            .ok_or(Error::InvalidData("RIFF chunk size overflow"))?;
        at = payload
            .checked_add(padded)
            .ok_or(Error::InvalidData("RIFF chunk size overflow"))?;
    }
}

fn read_vp8_frame(data: &[u8], payload: usize) -> Result<PixelDimensions> {
    // keyframe signature follows the 3-byte frame tag
    if !tag_at(data, payload + 3, &[0x9D, 0x01, 0x2A]) {
        return Err(Error::InvalidData("missing VP8 keyframe signature"));
    }
    let width = u32::from(le_u16(data, payload + 6)? & 0x3FFF);
    let height = u32::from(le_u16(data, payload + 8)? & 0x3FFF);
    PixelDimensions::new(width, height)
}

fn read_vp8l_frame(data: &[u8], payload: usize) -> Result<PixelDimensions> {
    if data.get(payload) != Some(&0x2F) {
        return Err(Error::InvalidData("missing VP8L signature"));
    }
    // 14 bits of width-1, then 14 bits of height-1
    let packed = le_u32(data, payload + 1)?;
    let width = (packed & 0x3FFF) + 1;
    let height = ((packed >> 14) & 0x3FFF) + 1;
    PixelDimensions::new(width, height)
}

fn read_vp8x_canvas(data: &[u8], payload: usize) -> Result<PixelDimensions> {
    // 24-bit minus-one canvas extents follow the flag bytes
    let width = le_u24(data, payload + 4)? + 1;
    let height = le_u24(data, payload + 7)? + 1;
    PixelDimensions::new(width, height)
}

/// Read BMP dimensions from whichever DIB header the file carries.
pub(crate) fn read_bmp(data: &[u8]) -> Result<PixelDimensions> {
    if data.len() < 26 || !tag_at(data, 0, b"BM") {
        return Err(Error::InvalidData("missing BM magic"));
    }
    match le_u32(data, 14)? {
        // BITMAPCOREHEADER: unsigned 16-bit extents
        12 => {
            let width = u32::from(le_u16(data, 18)?);
            let height = u32::from(le_u16(data, 20)?);
            PixelDimensions::new(width, height)
        },
        // BITMAPINFOHEADER and later: signed, negative height = top-down
        size if size >= 40 => {
            let width = (le_u32(data, 18)? as i32).unsigned_abs();
            let height = (le_u32(data, 22)? as i32).unsigned_abs();
            PixelDimensions::new(width, height)
        },
        _ => Err(Error::Unsupported("unrecognized DIB header")),
    }
}
