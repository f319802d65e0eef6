//! Common functionality.

use std::cmp::Ordering;

use bytesize::ByteSize;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indexmap::IndexMap;

pub mod io;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!("RSS now: {}", ByteSize::b(rss)),
        Err(e) => tracing::trace!("could not determine RSS: {}", e),
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "M",
];

/// Build mapping of chromosome names to chromosome counts.
///
/// The numeric aliases `23`, `24` and `25` used by PLINK-style panels map onto `X`, `Y` and
/// `M`, respectively.
pub fn build_chrom_map() -> IndexMap<String, usize> {
    let mut result = IndexMap::new();
    for (i, &chrom_name) in CHROMS.iter().enumerate() {
        result.insert(chrom_name.to_owned(), i);
        result.insert(format!("chr{chrom_name}").to_owned(), i);
    }
    result.insert("x".to_owned(), 22);
    result.insert("y".to_owned(), 23);
    result.insert("chrx".to_owned(), 22);
    result.insert("chry".to_owned(), 23);
    result.insert("23".to_owned(), 22);
    result.insert("24".to_owned(), 23);
    result.insert("25".to_owned(), 24);
    result.insert("mt".to_owned(), 24);
    result.insert("m".to_owned(), 24);
    result.insert("chrmt".to_owned(), 24);
    result.insert("chrm".to_owned(), 24);
    result.insert("MT".to_owned(), 24);
    result.insert("chrMT".to_owned(), 24);
    result
}

/// Compare two chromosome names in karyotypic order.
///
/// Names unknown to `chrom_map` sort after the canonical ones, lexicographically.
pub fn cmp_chrom(chrom_map: &IndexMap<String, usize>, lhs: &str, rhs: &str) -> Ordering {
    match (chrom_map.get(lhs), chrom_map.get(rhs)) {
        (Some(l), Some(r)) => l.cmp(r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => lhs.cmp(rhs),
    }
}

/// Translate a chromosome name of the input into the naming of the association catalogs.
///
/// The catalogs use `X` where the input files use `23`.
pub fn to_catalog_chrom(chrom: &str) -> String {
    match chrom {
        "23" => "X".to_string(),
        _ => chrom.to_string(),
    }
}

/// Inverse of `to_catalog_chrom()`.
pub fn from_catalog_chrom(chrom: &str) -> String {
    match chrom {
        "X" => "23".to_string(),
        _ => chrom.to_string(),
    }
}

/// Number of significant digits used when writing floating point numbers.
pub const SIGNIFICANT_DIGITS: usize = 3;

/// Format `value` like C's `%.<digits>g`.
///
/// Non-finite values are written as `nan`, `inf` or `-inf`.
pub fn format_sig(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return "nan".to_string();
    } else if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    } else if value == 0.0 {
        return "0".to_string();
    }

    let digits = digits.max(1);
    let sci = format!("{:.*e}", digits - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

/// Shortcut for `format_sig(value, SIGNIFICANT_DIGITS)`.
pub fn fmt_num(value: f64) -> String {
    format_sig(value, SIGNIFICANT_DIGITS)
}

/// Remove trailing zeroes of the fractional part and a dangling decimal point.
fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    #[test]
    fn trace_rss_now_smoke() {
        super::trace_rss_now();
    }

    #[rstest::rstest]
    #[case("1", 0)]
    #[case("chr1", 0)]
    #[case("X", 22)]
    #[case("23", 22)]
    #[case("chrMT", 24)]
    fn build_chrom_map(#[case] name: &str, #[case] expected: usize) {
        let map = super::build_chrom_map();
        assert_eq!(map.get(name).copied(), Some(expected));
    }

    #[rstest::rstest]
    #[case("1", "2", std::cmp::Ordering::Less)]
    #[case("10", "9", std::cmp::Ordering::Greater)]
    #[case("X", "22", std::cmp::Ordering::Greater)]
    #[case("23", "X", std::cmp::Ordering::Equal)]
    #[case("GL000192.1", "Y", std::cmp::Ordering::Greater)]
    fn cmp_chrom(#[case] lhs: &str, #[case] rhs: &str, #[case] expected: std::cmp::Ordering) {
        let map = super::build_chrom_map();
        assert_eq!(super::cmp_chrom(&map, lhs, rhs), expected);
    }

    #[rstest::rstest]
    #[case("23", "X")]
    #[case("1", "1")]
    #[case("X", "X")]
    fn to_catalog_chrom(#[case] chrom: &str, #[case] expected: &str) {
        assert_eq!(super::to_catalog_chrom(chrom), expected);
    }

    #[rstest::rstest]
    #[case("X", "23")]
    #[case("7", "7")]
    fn from_catalog_chrom(#[case] chrom: &str, #[case] expected: &str) {
        assert_eq!(super::from_catalog_chrom(chrom), expected);
    }

    #[rstest::rstest]
    #[case(5e-8, "5e-08")]
    #[case(1.234e-12, "1.23e-12")]
    #[case(0.123456, "0.123")]
    #[case(0.0001, "0.0001")]
    #[case(12.0, "12")]
    #[case(1.0, "1")]
    #[case(1234.5, "1.23e+03")]
    #[case(-0.5, "-0.5")]
    #[case(0.0, "0")]
    #[case(0.9999, "1")]
    fn format_sig(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(super::format_sig(value, 3), expected);
    }

    #[test]
    fn format_sig_non_finite() {
        assert_eq!(super::fmt_num(f64::NAN), "nan");
        assert_eq!(super::fmt_num(f64::INFINITY), "inf");
    }
}
