//! Aggregation of the report into one row per locus.

use std::{cmp::Ordering, collections::HashSet, path::Path};

use indexmap::IndexMap;
use itertools::Itertools;

use super::report::ReportRow;
use crate::{
    catalog::Association,
    common::{fmt_num, io::open_write_maybe_gz},
    ld::LdLink,
    variants::{
        InputVariant, VariantTable, COL_CS_ID, COL_CS_PROB, COL_ENRICHMENT,
        COL_FUNCTIONAL_CATEGORY, COL_MOST_SEVERE_CONSEQUENCE, COL_MOST_SEVERE_GENE,
        COL_R2_TO_LEAD,
    },
};

/// Definition of the strict group of a locus.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum GroupingMethod {
    /// Variants at or below the significance threshold.
    #[default]
    Simple,
    /// Significant variants in LD with the lead.
    Ld,
    /// Variants in a credible set.
    Cred,
}

/// Settings for building the top-level report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopLevelSettings {
    pub grouping: GroupingMethod,
    pub significance_threshold: f64,
    /// Minimal r^2 to the lead for the strict group with `GroupingMethod::Ld`.
    pub strict_r2: f64,
    /// Trait codes reported in separate columns.
    pub efo_traits: Vec<String>,
}

const BASE_COLUMNS: &[&str] = &[
    "locus_id",
    "chr",
    "start",
    "end",
    "enrichment",
    "most_severe_gene",
    "most_severe_consequence",
    "lead_pval",
    "lead_beta",
    "lead_AF",
    "lead_AF_cases",
    "lead_AF_controls",
    "found_associations_strict",
    "found_associations_relaxed",
    "credible_set_variants",
    "functional_variants_strict",
    "functional_variants_relaxed",
];

const EFO_COLUMNS: &[&str] = &[
    "specific_efo_trait_associations_strict",
    "specific_efo_trait_associations_relaxed",
];

/// Written for missing numbers in the `|`-joined lists.
const MISSING_NUMBER: &str = "NA";

/// One row of the top-level report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopLevelRow {
    pub locus_id: String,
    pub chr: String,
    pub start: i64,
    pub end: i64,
    pub enrichment: String,
    pub most_severe_gene: String,
    pub most_severe_consequence: String,
    pub lead_pval: String,
    pub lead_beta: String,
    pub lead_af: String,
    pub lead_af_cases: String,
    pub lead_af_controls: String,
    pub found_associations_strict: String,
    pub found_associations_relaxed: String,
    pub credible_set_variants: String,
    pub functional_variants_strict: String,
    pub functional_variants_relaxed: String,
    /// Only set if traits of interest were given.
    pub specific_efo_strict: Option<String>,
    pub specific_efo_relaxed: Option<String>,
}

impl TopLevelRow {
    fn into_record(self) -> Vec<String> {
        let mut result = vec![
            self.locus_id,
            self.chr,
            self.start.to_string(),
            self.end.to_string(),
            self.enrichment,
            self.most_severe_gene,
            self.most_severe_consequence,
            self.lead_pval,
            self.lead_beta,
            self.lead_af,
            self.lead_af_cases,
            self.lead_af_controls,
            self.found_associations_strict,
            self.found_associations_relaxed,
            self.credible_set_variants,
            self.functional_variants_strict,
            self.functional_variants_relaxed,
        ];
        result.extend(self.specific_efo_strict);
        result.extend(self.specific_efo_relaxed);
        result
    }
}

/// A trait association of a locus with the r^2 of its variant to the lead.
#[derive(Debug, Clone, PartialEq)]
struct TraitEntry<'a> {
    code: &'a str,
    name: &'a str,
    r2: Option<f64>,
}

/// Sort by decreasing r^2 with missing values last, keep the first of each `(code, name)`.
fn dedup_traits<'a>(mut entries: Vec<TraitEntry<'a>>) -> Vec<TraitEntry<'a>> {
    entries.sort_by(|a, b| match (a.r2, b.r2) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    entries
        .into_iter()
        .unique_by(|e| (e.code, e.name))
        .collect()
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(fmt_num).unwrap_or_else(|| MISSING_NUMBER.to_string())
}

fn join_traits<'a>(entries: impl Iterator<Item = &'a TraitEntry<'a>>) -> String {
    entries
        .map(|e| format!("{}|{}", e.name, fmt_opt(e.r2)))
        .join(";")
}

/// Raw value of a lead column, numbers rounded.
fn lead_value(table: &VariantTable, row: &InputVariant, name: &str) -> String {
    match table.value(row, name) {
        Some(value) => value
            .parse::<f64>()
            .map(fmt_num)
            .unwrap_or_else(|_| value.to_string()),
        None => String::new(),
    }
}

struct LocusAggregator<'a> {
    table: &'a VariantTable,
    hits: &'a [Association],
    links: &'a [LdLink],
    settings: &'a TopLevelSettings,
}

impl<'a> LocusAggregator<'a> {
    fn is_strict(&self, row: &InputVariant) -> bool {
        match self.settings.grouping {
            GroupingMethod::Cred => self.table.value(row, COL_CS_ID).is_some(),
            GroupingMethod::Ld => {
                row.pval <= self.settings.significance_threshold
                    && self
                        .table
                        .float_value(row, COL_R2_TO_LEAD)
                        .is_some_and(|r2| r2 >= self.settings.strict_r2)
            }
            GroupingMethod::Simple => row.pval <= self.settings.significance_threshold,
        }
    }

    /// The member whose identifier equals the locus identifier, else the most significant one.
    fn lead(&self, locus_id: &str, members: &[&'a ReportRow]) -> Option<&'a InputVariant> {
        let rows = || members.iter().map(|m| &self.table.rows[m.input]);
        rows().find(|row| row.id == locus_id).or_else(|| {
            rows().min_by(|a, b| a.pval.partial_cmp(&b.pval).unwrap_or(Ordering::Equal))
        })
    }

    fn row(&self, locus_id: &str, members: &[&'a ReportRow]) -> Option<TopLevelRow> {
        let table = self.table;
        let first = &table.rows[members.first()?.input];
        let lead = self.lead(locus_id, members)?;
        let inputs = members
            .iter()
            .map(|m| m.input)
            .unique()
            .map(|i| &table.rows[i])
            .collect::<Vec<_>>();

        let mut result = TopLevelRow {
            locus_id: locus_id.to_string(),
            chr: first.variant.chrom.clone(),
            start: inputs.iter().map(|r| r.variant.pos).min()?,
            end: inputs.iter().map(|r| r.variant.pos).max()?,
            lead_pval: lead_value(table, lead, &table.columns.pval),
            lead_beta: lead_value(table, lead, &table.columns.beta),
            lead_af: lead_value(table, lead, &table.columns.af),
            lead_af_cases: lead_value(table, lead, &table.columns.af_cases),
            lead_af_controls: lead_value(table, lead, &table.columns.af_controls),
            ..Default::default()
        };
        if lead.id == locus_id {
            let text = |name: &str| table.value(lead, name).unwrap_or_default().to_string();
            result.enrichment = text(COL_ENRICHMENT);
            result.most_severe_gene = text(COL_MOST_SEVERE_GENE);
            result.most_severe_consequence = text(COL_MOST_SEVERE_CONSEQUENCE);
        }

        result.credible_set_variants = inputs
            .iter()
            .filter(|row| table.value(row, COL_CS_ID).is_some())
            .map(|row| format!("{}|{}", row.id, fmt_opt(table.float_value(row, COL_CS_PROB))))
            .join(";");

        if table.has_column(COL_FUNCTIONAL_CATEGORY) && table.has_column(COL_R2_TO_LEAD) {
            let functional = inputs
                .iter()
                .filter_map(|row| Some((*row, table.value(row, COL_FUNCTIONAL_CATEGORY)?)))
                .collect::<Vec<_>>();
            result.functional_variants_relaxed = functional
                .iter()
                .map(|(row, category)| {
                    let r2 = fmt_opt(table.float_value(row, COL_R2_TO_LEAD));
                    format!("{}|{}|{}", row.id, category, r2)
                })
                .join(";");
            result.functional_variants_strict = functional
                .iter()
                .filter(|(row, _)| self.is_strict(row))
                .map(|(row, category)| format!("{}|{}", row.id, category))
                .join(";");
        }

        let (relaxed, strict) = self.traits(locus_id, members);
        let efo = self
            .settings
            .efo_traits
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>();
        let is_efo = |e: &&TraitEntry| efo.contains(e.code);
        result.found_associations_relaxed = join_traits(relaxed.iter().filter(|e| !is_efo(e)));
        result.found_associations_strict = join_traits(strict.iter().filter(|e| !is_efo(e)));
        if !efo.is_empty() {
            result.specific_efo_relaxed = Some(join_traits(relaxed.iter().filter(is_efo)));
            result.specific_efo_strict = Some(join_traits(strict.iter().filter(is_efo)));
        }
        Some(result)
    }

    /// Relaxed and strict trait associations of a locus.
    ///
    /// LD links of the lead contribute to the relaxed traits with their r^2.
    fn traits(
        &self,
        locus_id: &str,
        members: &[&'a ReportRow],
    ) -> (Vec<TraitEntry<'a>>, Vec<TraitEntry<'a>>) {
        let mut relaxed = Vec::new();
        let mut strict = Vec::new();
        for member in members {
            let Some(hit) = member.hit.map(|i| &self.hits[i]) else {
                continue;
            };
            let Some(name) = hit.trait_name.as_deref() else {
                continue;
            };
            let row = &self.table.rows[member.input];
            let entry = TraitEntry {
                code: &hit.trait_code,
                name,
                r2: self.table.float_value(row, COL_R2_TO_LEAD),
            };
            if self.is_strict(row) {
                strict.push(entry.clone());
            }
            relaxed.push(entry);
        }

        for link in self
            .links
            .iter()
            .filter(|l| l.locus_id == locus_id && l.member_id == locus_id)
        {
            relaxed.extend(
                self.hits
                    .iter()
                    .filter(|hit| hit.variant().canonical_id() == link.hit_canonical_id)
                    .filter_map(|hit| {
                        Some(TraitEntry {
                            code: &hit.trait_code,
                            name: hit.trait_name.as_deref()?,
                            r2: Some(link.r2),
                        })
                    }),
            );
        }
        (dedup_traits(relaxed), dedup_traits(strict))
    }
}

/// Build one row per locus, in order of first appearance in `rows`.
pub fn build_top_level(
    table: &VariantTable,
    hits: &[Association],
    rows: &[ReportRow],
    links: &[LdLink],
    settings: &TopLevelSettings,
) -> Vec<TopLevelRow> {
    let mut loci: IndexMap<&str, Vec<&ReportRow>> = IndexMap::new();
    for row in rows {
        if let Some(locus_id) = table.rows[row.input].locus_id.as_deref() {
            loci.entry(locus_id).or_default().push(row);
        }
    }

    let aggregator = LocusAggregator {
        table,
        hits,
        links,
        settings,
    };
    loci.into_iter()
        .filter_map(|(locus_id, members)| aggregator.row(locus_id, &members))
        .collect()
}

/// Write the top-level report; the trait-of-interest columns are added if `with_efo`.
pub fn write_top_level(
    path: &Path,
    rows: Vec<TopLevelRow>,
    with_efo: bool,
) -> Result<(), anyhow::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(
            open_write_maybe_gz(path)
                .map_err(|e| anyhow::anyhow!("Cannot open {:?} for writing: {:?}", path, e))?,
        );

    let mut header = BASE_COLUMNS.to_vec();
    if with_efo {
        header.extend_from_slice(EFO_COLUMNS);
    }
    writer.write_record(&header)?;
    for row in rows {
        writer.write_record(row.into_record())?;
    }
    writer.flush()?;
    Ok(())
}
