// src/version/mod.rs

//! Version handling for pacman-style package versions
//!
//! Versions follow the `[epoch:]pkgver[-pkgrel]` format. Comparison
//! matches vercmp: epochs compare numerically, pkgver and pkgrel compare
//! segment by segment where numeric segments compare numerically and
//! alphabetic segments compare lexicographically.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed package version with epoch, pkgver, and pkgrel components
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageVersion {
    pub epoch: u32,
    pub pkgver: String,
    pub pkgrel: String,
}

impl PackageVersion {
    pub fn new(epoch: u32, pkgver: impl Into<String>, pkgrel: impl Into<String>) -> Self {
        Self {
            epoch,
            pkgver: pkgver.into(),
            pkgrel: pkgrel.into(),
        }
    }

    /// Parse a version string
    ///
    /// Format: [epoch:]pkgver[-pkgrel]
    /// Examples:
    /// - "1.2.3" → epoch=0, pkgver="1.2.3", pkgrel=""
    /// - "2:1.2.3-4" → epoch=2, pkgver="1.2.3", pkgrel="4"
    pub fn parse(s: &str) -> Result<Self> {
        let (epoch_str, rest) = match s.find(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => ("", s),
        };

        let epoch = if epoch_str.is_empty() {
            0
        } else {
            epoch_str
                .parse::<u32>()
                .map_err(|e| Error::Parse(format!("invalid epoch in version '{}': {}", s, e)))?
        };

        // pkgrel is everything after the last dash; a dash inside pkgver is
        // not valid in pacman versions
        let (pkgver, pkgrel) = match rest.rfind('-') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, ""),
        };

        if pkgver.is_empty() {
            return Err(Error::Parse(format!("empty pkgver component in '{}'", s)));
        }

        Ok(Self {
            epoch,
            pkgver: pkgver.to_string(),
            pkgrel: pkgrel.to_string(),
        })
    }

    /// Compare two versions with vercmp semantics
    pub fn compare(&self, other: &PackageVersion) -> Ordering {
        match self.epoch.cmp(&other.epoch) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match compare_version_segments(&self.pkgver, &other.pkgver) {
            Ordering::Equal => {}
            ord => return ord,
        }
        // an absent pkgrel matches any pkgrel
        if self.pkgrel.is_empty() || other.pkgrel.is_empty() {
            return Ordering::Equal;
        }
        compare_version_segments(&self.pkgrel, &other.pkgrel)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}", self.pkgver)?;
        if !self.pkgrel.is_empty() {
            write!(f, "-{}", self.pkgrel)?;
        }
        Ok(())
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Segment-wise comparison of two version strings
///
/// Splits both strings into runs of digits and runs of letters, skipping
/// separators. Numeric runs compare numerically (leading zeros stripped),
/// alphabetic runs compare lexicographically, and a numeric run is always
/// newer than an alphabetic one. When one string runs out, the longer one
/// is newer unless its next segment is alphabetic (so "1.0" > "1.0a").
pub fn compare_version_segments(a: &str, b: &str) -> Ordering {
    let mut a = a.as_bytes();
    let mut b = b.as_bytes();

    loop {
        // skip separators
        while !a.is_empty() && !a[0].is_ascii_alphanumeric() {
            a = &a[1..];
        }
        while !b.is_empty() && !b[0].is_ascii_alphanumeric() {
            b = &b[1..];
        }
        if a.is_empty() || b.is_empty() {
            break;
        }

        let a_numeric = a[0].is_ascii_digit();
        let b_numeric = b[0].is_ascii_digit();
        let a_seg = take_segment(&mut a, a_numeric);
        let b_seg = take_segment(&mut b, b_numeric);

        let ord = match (a_numeric, b_numeric) {
            (true, true) => compare_numeric(a_seg, b_seg),
            (false, false) => a_seg.cmp(b_seg),
            // a numeric segment is newer than an alphabetic one
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        // the string with a remaining segment is newer, unless that
        // segment is alphabetic
        (true, false) => {
            if b[0].is_ascii_alphabetic() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if a[0].is_ascii_alphabetic() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => Ordering::Equal,
    }
}

fn take_segment<'a>(s: &mut &'a [u8], numeric: bool) -> &'a [u8] {
    let end = s
        .iter()
        .position(|c| {
            if numeric {
                !c.is_ascii_digit()
            } else {
                !c.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    let (seg, rest) = s.split_at(end);
    *s = rest;
    seg
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let a = trim_leading_zeros(a);
    let b = trim_leading_zeros(b);
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_simple() {
        let parsed = v("1.2.3");
        assert_eq!(parsed.epoch, 0);
        assert_eq!(parsed.pkgver, "1.2.3");
        assert_eq!(parsed.pkgrel, "");
    }

    #[test]
    fn test_parse_full() {
        let parsed = v("2:1.2.3-4");
        assert_eq!(parsed.epoch, 2);
        assert_eq!(parsed.pkgver, "1.2.3");
        assert_eq!(parsed.pkgrel, "4");
    }

    #[test]
    fn test_parse_empty_epoch() {
        let parsed = v(":1.2.3-4");
        assert_eq!(parsed.epoch, 0);
        assert_eq!(parsed.pkgver, "1.2.3");
    }

    #[test]
    fn test_parse_rejects_empty_pkgver() {
        assert!(PackageVersion::parse("2:-1").is_err());
    }

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert!(v("1.10-1") > v("1.9-1"));
        assert!(v("1.2.3") < v("1.2.10"));
    }

    #[test]
    fn test_epoch_dominates() {
        assert!(v("0:1.0-1") < v("1:1.0-1"));
        assert!(v("1:0.1-1") > v("2.0-1"));
    }

    #[test]
    fn test_pkgrel_compares() {
        assert!(v("1.0-2") > v("1.0-1"));
        assert!(v("1.0-10") > v("1.0-9"));
    }

    #[test]
    fn test_alpha_segments_compare_lexically() {
        assert!(v("1.0a-1") < v("1.0b-1"));
    }

    #[test]
    fn test_trailing_alpha_is_older() {
        assert!(v("1.0") > v("1.0a"));
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    fn test_missing_pkgrel_matches_any() {
        assert_eq!(v("1.0").compare(&v("1.0-5")), Ordering::Equal);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(v("1.05-1").compare(&v("1.5-1")), Ordering::Equal);
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(v("1.2.3").to_string(), "1.2.3");
        assert_eq!(v("2:1.2.3-4").to_string(), "2:1.2.3-4");
    }
}
