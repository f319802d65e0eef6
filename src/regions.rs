//! Genomic regions and merging of overlapping regions into query windows.

use std::collections::BTreeMap;

use crate::err::AppError;

/// A closed interval `[start, end]` on a chromosome.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    chrom: String,
    start: i64,
    end: i64,
}

impl Region {
    /// Construct a new region.
    ///
    /// # Errors
    ///
    /// If `start > end`.
    pub fn new(chrom: impl Into<String>, start: i64, end: i64) -> Result<Self, AppError> {
        let chrom = chrom.into();
        if start > end {
            return Err(AppError::InvalidRegion { chrom, start, end });
        }
        Ok(Self { chrom, start, end })
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Whether the two regions share at least one position.
    pub fn overlaps(&self, other: &Region) -> bool {
        self.chrom == other.chrom && self.start <= other.end && other.start <= self.end
    }

    /// Whether `pos` lies within the region.
    pub fn contains(&self, chrom: &str, pos: i64) -> bool {
        self.chrom == chrom && self.start <= pos && pos <= self.end
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// Merge overlapping regions.
///
/// The result is the minimal set of pairwise non-overlapping regions covering the same
/// positions, ordered by chromosome name and start.  Touching regions are merged, adjacent
/// ones (`end + 1 == start`) are not.
pub fn merge_regions(regions: impl IntoIterator<Item = Region>) -> Vec<Region> {
    let mut by_chrom: BTreeMap<String, Vec<Region>> = BTreeMap::new();
    for region in regions {
        by_chrom
            .entry(region.chrom.clone())
            .or_default()
            .push(region);
    }

    let mut result = Vec::new();
    for (_, mut chrom_regions) in by_chrom {
        chrom_regions.sort_by_key(|r| (r.start, r.end));
        let mut iter = chrom_regions.into_iter();
        let Some(mut current) = iter.next() else {
            continue;
        };
        for region in iter {
            if current.overlaps(&region) {
                current.end = current.end.max(region.end);
            } else {
                result.push(std::mem::replace(&mut current, region));
            }
        }
        result.push(current);
    }
    result
}

/// Build a window of `pad` base pairs around `pos`, clipping both ends at zero.
pub fn padded(chrom: &str, pos: i64, pad: i64) -> Region {
    let pad = pad.max(0);
    Region {
        chrom: chrom.to_string(),
        start: (pos - pad).max(0),
        end: (pos + pad).max(0),
    }
}
