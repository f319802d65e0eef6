//! Variant identity and the input table of significant variants.

pub mod alleles;
pub mod indels;

use std::{io::Read, path::Path};

use indexmap::IndexMap;

use crate::{
    common::{from_catalog_chrom, io::open_read_maybe_gz},
    err::AppError,
};

/// Column holding the variant identifier.
pub const COL_VARIANT: &str = "#variant";
/// Column holding the locus (group) identifier, equal to the lead variant's identifier.
pub const COL_LOCUS_ID: &str = "locus_id";
/// Column holding the locus start.
pub const COL_POS_RMIN: &str = "pos_rmin";
/// Column holding the locus end.
pub const COL_POS_RMAX: &str = "pos_rmax";
/// Credible set identifier, empty if the variant is not in a credible set.
pub const COL_CS_ID: &str = "cs_id";
/// Credible set posterior probability.
pub const COL_CS_PROB: &str = "cs_prob";
/// Functional category from the annotation step.
pub const COL_FUNCTIONAL_CATEGORY: &str = "functional_category";
/// LD r^2 between the variant and its locus lead.
pub const COL_R2_TO_LEAD: &str = "r2_to_lead";
/// Population enrichment from the annotation step.
pub const COL_ENRICHMENT: &str = "GENOME_FI_enrichment_nfe_est";
pub const COL_MOST_SEVERE_GENE: &str = "most_severe_gene";
pub const COL_MOST_SEVERE_CONSEQUENCE: &str = "most_severe_consequence";

/// Values that are read as missing.
const MISSING_VALUES: &[&str] = &["", "NA", "NaN", "nan", "N/A", "null", "None"];

/// Return `None` for values that represent missing data.
pub fn present(value: &str) -> Option<&str> {
    if MISSING_VALUES.contains(&value) {
        None
    } else {
        Some(value)
    }
}

/// Parse a position, accepting float notation such as `123.0`.
pub fn parse_position(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

/// A sequence variant with 1-based position.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct Variant {
    pub chrom: String,
    pub pos: i64,
    pub ref_allele: String,
    pub alt_allele: String,
}

impl Variant {
    pub fn new(
        chrom: impl Into<String>,
        pos: i64,
        ref_allele: impl Into<String>,
        alt_allele: impl Into<String>,
    ) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
            ref_allele: ref_allele.into(),
            alt_allele: alt_allele.into(),
        }
    }

    /// Identifier in the form `chr{chrom}_{pos}_{ref}_{alt}`.
    pub fn id(&self) -> String {
        format!(
            "chr{}_{}_{}_{}",
            self.chrom, self.pos, self.ref_allele, self.alt_allele
        )
    }

    /// Identifier built from the canonicalized allele pair.
    ///
    /// Two records of the same variant reported on different strands or with swapped
    /// alleles have the same canonical identifier.
    pub fn canonical_id(&self) -> String {
        let (a1, a2) = alleles::canonicalize(&self.ref_allele, &self.alt_allele);
        format!("chr{}_{}_{}_{}", self.chrom, self.pos, a1, a2)
    }

    /// Parse an identifier as produced by `id()`.
    pub fn from_id(id: &str) -> Option<Self> {
        let stripped = id.strip_prefix("chr").unwrap_or(id);
        let mut parts = stripped.split('_');
        let (chrom, pos, ref_allele, alt_allele) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || chrom.is_empty() {
            return None;
        }
        Some(Self::new(
            chrom,
            pos.parse().ok()?,
            ref_allele,
            alt_allele,
        ))
    }
}

/// Default labels for `ColumnNames::from_labels()`.
pub const DEFAULT_COLUMN_LABELS: [&str; 9] = [
    "#chrom",
    "pos",
    "ref",
    "alt",
    "pval",
    "beta",
    "maf",
    "maf_cases",
    "maf_controls",
];

/// Configurable names of the input table's core columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnNames {
    pub chrom: String,
    pub pos: String,
    pub ref_allele: String,
    pub alt_allele: String,
    pub pval: String,
    pub beta: String,
    pub af: String,
    pub af_cases: String,
    pub af_controls: String,
}

impl ColumnNames {
    /// Build from the nine labels in the order of `DEFAULT_COLUMN_LABELS`.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Result<Self, AppError> {
        if labels.len() != DEFAULT_COLUMN_LABELS.len() {
            return Err(AppError::InvalidColumnLabels {
                expected: DEFAULT_COLUMN_LABELS.len(),
                actual: labels.len(),
            });
        }
        let l = |i: usize| labels[i].as_ref().to_string();
        Ok(Self {
            chrom: l(0),
            pos: l(1),
            ref_allele: l(2),
            alt_allele: l(3),
            pval: l(4),
            beta: l(5),
            af: l(6),
            af_cases: l(7),
            af_controls: l(8),
        })
    }

    /// Columns that must be present in every input table.
    fn required(&self) -> [&str; 5] {
        [
            &self.chrom,
            &self.pos,
            &self.ref_allele,
            &self.alt_allele,
            &self.pval,
        ]
    }
}

impl Default for ColumnNames {
    fn default() -> Self {
        let [chrom, pos, ref_allele, alt_allele, pval, beta, af, af_cases, af_controls] =
            DEFAULT_COLUMN_LABELS.map(str::to_string);
        Self {
            chrom,
            pos,
            ref_allele,
            alt_allele,
            pval,
            beta,
            af,
            af_cases,
            af_controls,
        }
    }
}

/// One row of the input table.
#[derive(Debug, Clone, PartialEq)]
pub struct InputVariant {
    pub variant: Variant,
    /// Value of the `#variant` column.
    pub id: String,
    pub pval: f64,
    pub locus_id: Option<String>,
    pub pos_rmin: Option<i64>,
    pub pos_rmax: Option<i64>,
    /// All values in the order of the table header.
    pub fields: Vec<String>,
}

/// The table of significant variants handed in by the caller.
#[derive(Debug, Clone, Default)]
pub struct VariantTable {
    pub columns: ColumnNames,
    /// Header, including a derived `#variant` column if the input lacked it.
    pub header: Vec<String>,
    index: IndexMap<String, usize>,
    pub rows: Vec<InputVariant>,
}

impl VariantTable {
    /// Read a tab-separated table from `path`.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        columns: &ColumnNames,
    ) -> Result<Self, anyhow::Error> {
        let label = path.as_ref().display().to_string();
        let reader = open_read_maybe_gz(path.as_ref())
            .map_err(|e| anyhow::anyhow!("could not open {} for reading: {}", &label, e))?;
        Self::from_reader(reader, columns, &label)
    }

    /// Read a tab-separated table; `label` names the source in error messages.
    ///
    /// Chromosome `X` is read as `23`, the naming used throughout.
    pub fn from_reader<R: Read>(
        reader: R,
        columns: &ColumnNames,
        label: &str,
    ) -> Result<Self, anyhow::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(reader);
        let mut header = reader
            .headers()
            .map_err(|e| anyhow::anyhow!("could not read header of {}: {}", label, e))?
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();

        let missing = columns
            .required()
            .iter()
            .filter(|name| !header.iter().any(|h| h == *name))
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(AppError::MissingColumns {
                path: label.to_string(),
                missing,
            }
            .into());
        }

        let derive_id = !header.iter().any(|h| h == COL_VARIANT);
        if derive_id {
            tracing::debug!("{} has no {} column, deriving it", label, COL_VARIANT);
            header.push(COL_VARIANT.to_string());
        }
        let index = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect::<IndexMap<_, _>>();
        let col = |name: &str| index.get(name).copied();
        let (i_chrom, i_pos, i_ref, i_alt, i_pval) = (
            index[&columns.chrom],
            index[&columns.pos],
            index[&columns.ref_allele],
            index[&columns.alt_allele],
            index[&columns.pval],
        );
        let (i_locus, i_rmin, i_rmax) = (
            col(COL_LOCUS_ID),
            col(COL_POS_RMIN),
            col(COL_POS_RMAX),
        );

        let mut rows = Vec::new();
        for (line_no, record) in reader.records().enumerate() {
            let record =
                record.map_err(|e| anyhow::anyhow!("problem reading {}: {}", label, e))?;
            let mut fields = record.iter().map(|s| s.to_string()).collect::<Vec<_>>();
            // header is line 1
            let line = line_no + 2;

            let pos = parse_position(&fields[i_pos]).ok_or_else(|| {
                anyhow::anyhow!(
                    "{} line {}: invalid position {:?}",
                    label,
                    line,
                    &fields[i_pos]
                )
            })?;
            let pval = fields[i_pval].parse::<f64>().map_err(|e| {
                anyhow::anyhow!(
                    "{} line {}: invalid p-value {:?}: {}",
                    label,
                    line,
                    &fields[i_pval],
                    e
                )
            })?;
            let variant = Variant::new(
                from_catalog_chrom(&fields[i_chrom]),
                pos,
                fields[i_ref].clone(),
                fields[i_alt].clone(),
            );
            if derive_id {
                fields.push(variant.id());
            }
            let id = fields[index[COL_VARIANT]].clone();

            let opt_pos = |i: Option<usize>| -> Result<Option<i64>, anyhow::Error> {
                match i.and_then(|i| present(&fields[i])) {
                    None => Ok(None),
                    Some(value) => parse_position(value).map(Some).ok_or_else(|| {
                        anyhow::anyhow!(
                            "{} line {}: invalid locus bound {:?}",
                            label,
                            line,
                            value
                        )
                    }),
                }
            };
            let pos_rmin = opt_pos(i_rmin)?;
            let pos_rmax = opt_pos(i_rmax)?;
            let locus_id = i_locus
                .and_then(|i| present(&fields[i]))
                .map(|s| s.to_string());

            rows.push(InputVariant {
                variant,
                id,
                pval,
                locus_id,
                pos_rmin,
                pos_rmax,
                fields,
            });
        }

        Ok(Self {
            columns: columns.clone(),
            header,
            index,
            rows,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether the table carries locus assignments and bounds.
    pub fn has_grouping(&self) -> bool {
        [COL_LOCUS_ID, COL_POS_RMIN, COL_POS_RMAX]
            .iter()
            .all(|name| self.index.contains_key(*name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Value of column `name` in `row`, `None` if the column is absent or the value missing.
    pub fn value<'a>(&self, row: &'a InputVariant, name: &str) -> Option<&'a str> {
        self.index
            .get(name)
            .and_then(|i| row.fields.get(*i))
            .and_then(|v| present(v))
    }

    /// Like `value()` but parsed as a float.
    pub fn float_value(&self, row: &InputVariant, name: &str) -> Option<f64> {
        self.value(row, name).and_then(|v| v.parse::<f64>().ok())
    }

    /// Row indices grouped by locus, in order of first appearance.
    pub fn loci(&self) -> IndexMap<String, Vec<usize>> {
        let mut result: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            if let Some(locus_id) = &row.locus_id {
                result.entry(locus_id.clone()).or_default().push(i);
            }
        }
        result
    }
}
