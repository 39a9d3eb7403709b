// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Four-character codes for the boxes and brands this crate recognizes.

use std::fmt;

/// A four-character box or brand code.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const META: Self = Self(*b"meta");
    pub const IPRP: Self = Self(*b"iprp");
    pub const IPCO: Self = Self(*b"ipco");
    pub const ISPE: Self = Self(*b"ispe");
    pub const CLAP: Self = Self(*b"clap");

    pub const AVIF: Self = Self(*b"avif");
    pub const AVIS: Self = Self(*b"avis");
    pub const HEIC: Self = Self(*b"heic");
    pub const HEIX: Self = Self(*b"heix");
    pub const HEVC: Self = Self(*b"hevc");
    pub const HEVX: Self = Self(*b"hevx");
    pub const MIF1: Self = Self(*b"mif1");
    pub const MSF1: Self = Self(*b"msf1");

    /// Read a code at `at`, bounds-checked.
    pub fn read(buf: &[u8], at: usize) -> Option<Self> {
        let bytes = buf.get(at..at.checked_add(4)?)?;
        Some(Self([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_is_bounds_checked() {
        assert_eq!(FourCC::read(b"ispe", 0), Some(FourCC::ISPE));
        assert_eq!(FourCC::read(b"isp", 0), None);
        assert_eq!(FourCC::read(b"xxispe", 2), Some(FourCC::ISPE));
        assert_eq!(FourCC::read(b"ispe", usize::MAX), None);
    }

    #[test]
    fn display_prints_ascii_or_hex() {
        assert_eq!(FourCC::META.to_string(), "meta");
        assert_eq!(FourCC([0xFF, 0x00, 0x01, 0x02]).to_string(), "[ff, 00, 01, 02]");
    }
}
