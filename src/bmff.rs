// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded box-tree traversal for the ISOBMFF image family (AVIF/HEIC/HEIF).
//!
//! The walk never trusts a declared size: every box is clamped to its
//! enclosing range, and three hard caps bound the total work done on a
//! hostile buffer. A malformed box stops its own branch; whatever earlier
//! branches found is kept.

use fallible_collections::TryVec;
use log::debug;

use crate::boxes::FourCC;
use crate::{Error, PixelDimensions, Result, be_u32, be_u64};

/// Boxes whose header starts past this offset are not visited.
const SCAN_WINDOW: usize = 512 * 1024;
/// Upper bound on boxes visited across one traversal.
const MAX_BOXES: u32 = 2000;
/// Upper bound on container nesting.
const MAX_DEPTH: u32 = 32;

/// Basic ISO box structure.
///
/// Each box begins with a 32-bit size and a four-byte type; a size of `1`
/// escapes to a 64-bit size after the type, and a size of `0` extends the
/// box to the end of its enclosing scope.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    name: FourCC,
    /// Offset of the size field.
    start: usize,
    /// First payload byte.
    content_start: usize,
    /// One past the last payload byte; also where the next sibling starts.
    content_end: usize,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    const MIN_LARGE_SIZE: u64 = 16;
}

/// Parse a box header at `at`, validated against the enclosing range end.
fn read_box_header(buf: &[u8], at: usize, end: usize) -> Result<BoxHeader> {
    let size32 = be_u32(buf, at)?;
    let name = FourCC::read(buf, at + 4).ok_or(Error::UnexpectedEOF)?;
    let (offset, size) = match size32 {
        // valid only for the last box in its scope; extends to the scope end
        0 => (BoxHeader::MIN_SIZE, (end - at) as u64),
        1 => {
            let size64 = be_u64(buf, at + 8)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            (BoxHeader::MIN_LARGE_SIZE, size64)
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            (BoxHeader::MIN_SIZE, u64::from(size32))
        },
    };
    if size < offset {
        return Err(Error::InvalidData("box smaller than its own header"));
    }
    let declared_end = (at as u64)
        .checked_add(size)
        .ok_or(Error::InvalidData("box size overflow"))?;
    if declared_end > end as u64 {
        return Err(Error::InvalidData("box extends past its container"));
    }
    Ok(BoxHeader {
        name,
        start: at,
        content_start: at + offset as usize,
        content_end: declared_end as usize,
    })
}

/// Spatial extents read from an `ispe` box.
#[derive(Debug, Clone, Copy)]
struct IspeCandidate {
    width: u32,
    height: u32,
}

/// Crop read from a `clap` box, remembered by box position for pairing.
#[derive(Debug, Clone, Copy)]
struct ClapCandidate {
    /// Offset of the box header within the buffer.
    start: usize,
    /// Clean aperture width in whole pixels, rounded to nearest.
    aperture_width: u32,
}

/// Traversal state: the box budget and the best candidate so far.
struct Walk {
    visited: u32,
    best: Option<PixelDimensions>,
}

impl Walk {
    fn tally(&mut self) -> Result<()> {
        self.visited += 1;
        if self.visited > MAX_BOXES {
            return Err(Error::ResourceLimitExceeded("box budget exhausted"));
        }
        Ok(())
    }

    /// Keep the candidate with the largest pixel area. Containers routinely
    /// declare extents for a thumbnail and the primary image; the primary
    /// is the larger one.
    fn offer(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let area = u64::from(width) * u64::from(height);
        let incumbent = self
            .best
            .map_or(0, |d| u64::from(d.width) * u64::from(d.height));
        if area > incumbent {
            self.best = Some(PixelDimensions { width, height });
        }
    }
}

/// Extract the largest spatial extents declared anywhere in an ISOBMFF
/// image buffer.
pub(crate) fn largest_extents(buf: &[u8]) -> Result<PixelDimensions> {
    let mut walk = Walk { visited: 0, best: None };
    if let Err(err) = walk_level(buf, 0, buf.len(), 0, &mut walk) {
        // A blown cap ends the traversal but keeps earlier findings.
        debug!("box walk stopped early: {err}");
    }
    walk.best.ok_or(Error::InvalidData("no spatial extents found"))
}

fn walk_level(buf: &[u8], start: usize, end: usize, depth: u32, walk: &mut Walk) -> Result<()> {
    if depth > MAX_DEPTH {
        debug!("nesting deeper than {MAX_DEPTH}, abandoning branch");
        return Ok(());
    }
    let mut at = start;
    while at + BoxHeader::MIN_SIZE as usize <= end && at < SCAN_WINDOW {
        walk.tally()?;
        let header = match read_box_header(buf, at, end) {
            Ok(header) => header,
            // Malformed sibling: abandon the level, keep prior findings.
            Err(_) => break,
        };
        match header.name {
            FourCC::META => {
                // FullBox: 4 bytes of version/flags precede the children.
                let inner = header.content_start + 4;
                if inner <= header.content_end {
                    walk_level(buf, inner, header.content_end, depth + 1, walk)?;
                }
            },
            FourCC::IPRP => {
                walk_level(buf, header.content_start, header.content_end, depth + 1, walk)?;
            },
            FourCC::IPCO => scan_properties(buf, &header, walk)?,
            FourCC::ISPE => {
                if let Ok(ispe) = read_ispe(buf, &header) {
                    walk.offer(ispe.width, ispe.height);
                }
            },
            _ => debug!("skipping '{}'", header.name),
        }
        at = header.content_end;
    }
    Ok(())
}

/// Scan an `ipco` (item property container) for `ispe` and `clap` children.
///
/// The format's own property-to-item linkage lives in `ipma`, but crop and
/// extents for the same image sit adjacent in practice, so pairing is by
/// box order: each `ispe`, in document order, takes the first unconsumed
/// `clap` at an equal-or-later offset and loses the implied right crop.
fn scan_properties(buf: &[u8], ipco: &BoxHeader, walk: &mut Walk) -> Result<()> {
    let mut ispes: TryVec<IspeCandidate> = TryVec::new();
    let mut claps: TryVec<ClapCandidate> = TryVec::new();
    let mut stopped = None;

    let mut at = ipco.content_start;
    while at + BoxHeader::MIN_SIZE as usize <= ipco.content_end && at < SCAN_WINDOW {
        if let Err(err) = walk.tally() {
            stopped = Some(err);
            break;
        }
        let header = match read_box_header(buf, at, ipco.content_end) {
            Ok(header) => header,
            Err(_) => break,
        };
        match header.name {
            FourCC::ISPE => {
                if let Ok(ispe) = read_ispe(buf, &header) {
                    ispes.push(ispe)?;
                }
            },
            FourCC::CLAP => {
                if let Ok(clap) = read_clap(buf, &header) {
                    claps.push(clap)?;
                }
            },
            _ => {},
        }
        at = header.content_end;
    }

    let mut consumed = 0usize;
    for ispe in ispes.iter() {
        let mut width = ispe.width;
        if let Some(clap) = claps.iter().find(|clap| clap.start >= consumed) {
            consumed = clap.start + 1;
            if clap.aperture_width < width {
                let crop_right = width - clap.aperture_width;
                width -= crop_right;
            }
        }
        walk.offer(width, ispe.height);
    }

    match stopped {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Image spatial extents: FullBox version/flags, then width and height.
///
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe(buf: &[u8], header: &BoxHeader) -> Result<IspeCandidate> {
    let at = header.content_start;
    if at + 12 > header.content_end {
        return Err(Error::UnexpectedEOF);
    }
    let width = be_u32(buf, at + 4)?;
    let height = be_u32(buf, at + 8)?;
    if width == 0 || height == 0 {
        return Err(Error::InvalidData("ispe dimensions cannot be zero"));
    }
    Ok(IspeCandidate { width, height })
}

/// Clean aperture: eight 4-byte rational fields, no version/flags. Only
/// the width rational is read.
fn read_clap(buf: &[u8], header: &BoxHeader) -> Result<ClapCandidate> {
    let at = header.content_start;
    if at + 32 > header.content_end {
        return Err(Error::InvalidData("clap too short"));
    }
    let width_n = be_u32(buf, at)?;
    let width_d = be_u32(buf, at + 4)?;
    if width_d == 0 {
        return Err(Error::InvalidData("clap width denominator is zero"));
    }
    let rounded = (u64::from(width_n) + u64::from(width_d) / 2) / u64::from(width_d);
    let aperture_width =
        u32::try_from(rounded).map_err(|_| Error::InvalidData("clap width out of range"))?;
    Ok(ClapCandidate { start: header.start, aperture_width })
}
