//! Strand- and order-independent allele pairs.

/// Marker for an absent allele in indel notation.
pub const ABSENT: &str = "-";

/// Whether the allele pair describes an insertion or deletion.
pub fn is_indel(a1: &str, a2: &str) -> bool {
    a1 == ABSENT || a2 == ABSENT || a1.len() != a2.len()
}

/// Whether `allele` consists of `A`, `C`, `G` and `T` only.
pub fn is_valid_allele(allele: &str) -> bool {
    !allele.is_empty() && allele.chars().all(|c| matches!(c, 'A' | 'C' | 'G' | 'T'))
}

/// Reverse strand base of each position, upper-cased; other characters are kept.
pub fn complement(allele: &str) -> String {
    allele
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'A' => 'T',
            'T' => 'A',
            'C' => 'G',
            'G' => 'C',
            other => other,
        })
        .collect()
}

fn sorted_pair(a1: String, a2: String) -> (String, String) {
    if a1 <= a2 {
        (a1, a2)
    } else {
        (a2, a1)
    }
}

fn has_a(allele: &str) -> bool {
    allele.chars().any(|c| c.eq_ignore_ascii_case(&'a'))
}

/// Canonicalize an unordered allele pair.
///
/// Pairs without any `A` are complemented onto the other strand, then the pair is sorted.
/// If the complemented pair has no `A` either (only `C`/`G`), it is not simply complemented:
/// the smaller of both sorted strands is chosen so that both strands of a pair yield the same
/// result, e.g. `(CGG, CCC)` and `(GCC, GGG)` both give `(CCC, CGG)`.  Indels are only
/// sorted.
pub fn canonicalize(a1: &str, a2: &str) -> (String, String) {
    if is_indel(a1, a2) {
        return sorted_pair(a1.to_string(), a2.to_string());
    }

    let upper = sorted_pair(a1.to_ascii_uppercase(), a2.to_ascii_uppercase());
    if has_a(&upper.0) || has_a(&upper.1) {
        return upper;
    }
    let flipped = sorted_pair(complement(a1), complement(a2));
    if has_a(&flipped.0) || has_a(&flipped.1) {
        flipped
    } else {
        std::cmp::min(upper, flipped)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{canonicalize, complement};

    #[rstest::rstest]
    #[case("A", "G", ("A", "G"))]
    #[case("G", "A", ("A", "G"))]
    #[case("C", "T", ("A", "G"))]
    #[case("T", "C", ("A", "G"))]
    #[case("c", "t", ("A", "G"))]
    #[case("C", "G", ("C", "G"))]
    #[case("T", "A", ("A", "T"))]
    #[case("CGG", "CCC", ("CCC", "CGG"))]
    #[case("GCC", "GGG", ("CCC", "CGG"))]
    #[case("T", "TTCGA", ("T", "TTCGA"))]
    #[case("TCGA", "-", ("-", "TCGA"))]
    #[case("TTG", "T", ("T", "TTG"))]
    fn canonicalize_cases(#[case] a1: &str, #[case] a2: &str, #[case] expected: (&str, &str)) {
        let (c1, c2) = canonicalize(a1, a2);
        assert_eq!((c1.as_str(), c2.as_str()), expected);
    }

    #[rstest::rstest]
    #[case("A", "G")]
    #[case("C", "T")]
    #[case("G", "C")]
    #[case("CT", "GT")]
    #[case("CGG", "CCC")]
    #[case("GGT", "CTT")]
    fn canonicalize_both_strands(#[case] a1: &str, #[case] a2: &str) {
        assert_eq!(canonicalize(a1, a2), canonicalize(a2, a1));
        assert_eq!(
            canonicalize(a1, a2),
            canonicalize(&complement(a1), &complement(a2))
        );
    }

    #[rstest::rstest]
    #[case("ACGT", true)]
    #[case("N", false)]
    #[case("acgt", false)]
    #[case("-", false)]
    #[case("", false)]
    fn is_valid_allele(#[case] allele: &str, #[case] expected: bool) {
        assert_eq!(super::is_valid_allele(allele), expected);
    }

    #[test]
    fn complement_keeps_unknown() {
        assert_eq!(complement("acgtN-"), "TGCAN-");
    }
}
