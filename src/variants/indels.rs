//! Reconciliation of indels reported with an absent allele against local variants.
//!
//! Catalogs report indels as e.g. `101 -/TCGA` while the local variants carry the padding
//! base, e.g. `100 T/TTCGA`.

use std::collections::HashMap;

use super::{alleles::ABSENT, Variant};

/// Local variants indexed by chromosome and position.
#[derive(Debug, Clone, Default)]
pub struct LocalVariants {
    by_pos: HashMap<(String, i64), Vec<Variant>>,
}

impl LocalVariants {
    pub fn new(variants: impl IntoIterator<Item = Variant>) -> Self {
        let mut by_pos: HashMap<(String, i64), Vec<Variant>> = HashMap::new();
        for variant in variants {
            by_pos
                .entry((variant.chrom.clone(), variant.pos))
                .or_default()
                .push(variant);
        }
        for candidates in by_pos.values_mut() {
            candidates.sort();
            candidates.dedup();
        }
        Self { by_pos }
    }

    /// Reconcile a reported variant.
    ///
    /// Variants without an absent allele are returned unchanged.  Indels with an absent
    /// allele are rewritten onto the first matching local variant one base upstream, keeping
    /// the reported direction (insertion or deletion).  `None` if no local variant matches.
    pub fn reconcile(&self, reported: &Variant) -> Option<Variant> {
        let ref_absent = reported.ref_allele == ABSENT;
        let alt_absent = reported.alt_allele == ABSENT;
        if !ref_absent && !alt_absent {
            return Some(reported.clone());
        } else if ref_absent && alt_absent {
            return None;
        }
        let inserted = if ref_absent {
            &reported.alt_allele
        } else {
            &reported.ref_allele
        };

        let candidates = self
            .by_pos
            .get(&(reported.chrom.clone(), reported.pos - 1))?;
        candidates.iter().find_map(|local| {
            let (short, long) = padded_pair(&local.ref_allele, &local.alt_allele, inserted)?;
            let (ref_allele, alt_allele) = if ref_absent {
                (short, long)
            } else {
                (long, short)
            };
            Some(Variant::new(
                local.chrom.clone(),
                local.pos,
                ref_allele,
                alt_allele,
            ))
        })
    }
}

/// If one allele is a single base `b` and the other is `b` followed by `inserted`, return
/// `(b, b + inserted)`.
fn padded_pair<'a>(b1: &'a str, b2: &'a str, inserted: &str) -> Option<(&'a str, &'a str)> {
    let matches = |short: &str, long: &str| {
        short.len() == 1 && long.strip_prefix(short) == Some(inserted)
    };
    if matches(b1, b2) {
        Some((b1, b2))
    } else if matches(b2, b1) {
        Some((b2, b1))
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::LocalVariants;
    use crate::variants::Variant;

    fn local() -> LocalVariants {
        LocalVariants::new(vec![
            Variant::new("1", 100, "T", "TTCGA"),
            Variant::new("1", 200, "GAC", "G"),
            Variant::new("1", 300, "C", "CA"),
            Variant::new("1", 300, "A", "AA"),
            Variant::new("2", 100, "T", "TTCGA"),
        ])
    }

    #[rstest::rstest]
    #[case::insertion(("1", 101, "-", "TCGA"), Some(("1", 100, "T", "TTCGA")))]
    #[case::insertion_swapped(("1", 101, "TCGA", "-"), Some(("1", 100, "TTCGA", "T")))]
    #[case::deletion(("1", 201, "AC", "-"), Some(("1", 200, "GAC", "G")))]
    #[case::first_candidate_wins(("1", 301, "-", "A"), Some(("1", 300, "A", "AA")))]
    #[case::other_chrom(("3", 101, "-", "TCGA"), None)]
    #[case::no_match(("1", 101, "-", "TCG"), None)]
    #[case::wrong_pos(("1", 100, "-", "TCGA"), None)]
    #[case::both_absent(("1", 101, "-", "-"), None)]
    #[case::snv_unchanged(("1", 555, "A", "C"), Some(("1", 555, "A", "C")))]
    fn reconcile(
        #[case] reported: (&str, i64, &str, &str),
        #[case] expected: Option<(&str, i64, &str, &str)>,
    ) {
        let reported = Variant::new(reported.0, reported.1, reported.2, reported.3);
        let expected = expected.map(|(c, p, r, a)| Variant::new(c, p, r, a));
        assert_eq!(local().reconcile(&reported), expected);
    }
}
