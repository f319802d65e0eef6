//! Cross-referencing of significant variants against association sources.

pub mod cli;
pub mod report;
pub mod top_level;

use std::{path::Path, time::Instant};

use itertools::Itertools;
use thousands::Separable;

use crate::{
    catalog::{
        fetch_regions, resolve_trait_names, Association, AssociationSource, FILTERED_CODES,
    },
    common::{from_catalog_chrom, io::open_write_maybe_gz, to_catalog_chrom},
    ld::{LdVariant, LocusRequest},
    regions::{merge_regions, padded, Region},
    variants::{indels::LocalVariants, VariantTable},
};

/// Which sources to compare against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum CompareStyle {
    /// Custom resource file only.
    File,
    /// Association catalog only.
    #[default]
    Gwascatalog,
    /// Both of the above.
    Both,
}

impl CompareStyle {
    pub fn uses_catalog(self) -> bool {
        matches!(self, CompareStyle::Gwascatalog | CompareStyle::Both)
    }

    pub fn uses_custom(self) -> bool {
        matches!(self, CompareStyle::File | CompareStyle::Both)
    }
}

/// Settings for the retrieval of associations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    /// p-value threshold for associations.
    pub pval: f64,
    /// Padding around each input variant in base pairs.
    pub pad_bp: i64,
    /// Maximal number of concurrent region queries.
    pub fan_out: usize,
    /// Fail the run if any region query fails.
    pub abort_on_failure: bool,
}

/// Padded and merged query regions around all input variants, in catalog chromosome naming.
pub fn catalog_regions(table: &VariantTable, pad_bp: i64) -> Vec<Region> {
    merge_regions(table.rows.iter().map(|row| {
        padded(
            &to_catalog_chrom(&row.variant.chrom),
            row.variant.pos,
            pad_bp,
        )
    }))
}

/// Merged locus bounds; variants without bounds get a padded window.
pub fn custom_regions(table: &VariantTable, pad_bp: i64) -> Vec<Region> {
    merge_regions(table.rows.iter().map(|row| {
        let chrom = &row.variant.chrom;
        match (row.pos_rmin, row.pos_rmax) {
            (Some(rmin), Some(rmax)) if rmin <= rmax => Region::new(chrom.as_str(), rmin, rmax)
                .unwrap_or_else(|_| padded(chrom, row.variant.pos, pad_bp)),
            _ => padded(chrom, row.variant.pos, pad_bp),
        }
    }))
}

/// Associations of a source and the regions whose query failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieved {
    pub hits: Vec<Association>,
    /// Failed query regions, in the chromosome naming of the input.
    pub failed: Vec<Region>,
}

impl Retrieved {
    pub fn extend(&mut self, other: Retrieved) {
        self.hits.extend(other.hits);
        self.failed.extend(other.failed);
    }

    /// Whether the query covering `chrom:pos` failed.
    pub fn failed_at(&self, chrom: &str, pos: i64) -> bool {
        self.failed.iter().any(|region| region.contains(chrom, pos))
    }
}

/// Query `regions`, logging failed regions.
///
/// Fails if any region fails and `abort_on_failure` is set, or if all regions fail.
async fn collect_regions(
    source: &dyn AssociationSource,
    regions: &[Region],
    settings: &RetrievalSettings,
) -> Result<Retrieved, anyhow::Error> {
    let before_fetch = Instant::now();
    tracing::info!(
        "querying {} for {} regions",
        source.name(),
        regions.len().separate_with_commas()
    );
    let mut result = Retrieved::default();
    for (region, fetched) in fetch_regions(source, regions, settings.pval, settings.fan_out).await
    {
        match fetched {
            Ok(associations) => result.hits.extend(associations),
            Err(e) => {
                tracing::error!("no associations for region {}: {}", &region, &e);
                if settings.abort_on_failure {
                    return Err(anyhow::anyhow!(
                        "query of {} failed for region {}: {}",
                        source.name(),
                        &region,
                        e
                    ));
                }
                result.failed.push(region);
            }
        }
    }
    if !regions.is_empty() && result.failed.len() == regions.len() {
        return Err(anyhow::anyhow!(
            "all {} region queries of {} failed",
            regions.len(),
            source.name()
        ));
    }
    tracing::info!(
        "... got {} associations in {:?} ({} regions failed)",
        result.hits.len().separate_with_commas(),
        before_fetch.elapsed(),
        result.failed.len()
    );
    Ok(result)
}

/// Map catalog associations onto the input's variants.
///
/// Chromosome names are translated back, indels with an absent allele are reconciled
/// against the input variants, untrusted harmonization codes are removed and duplicates of
/// `(variant, trait)` dropped.
pub fn align_catalog_hits(raw: Vec<Association>, table: &VariantTable) -> Vec<Association> {
    let local = LocalVariants::new(table.rows.iter().map(|row| row.variant.clone()));
    let count_raw = raw.len();
    let result = raw
        .into_iter()
        .map(|a| {
            let chrom = from_catalog_chrom(&a.chrom);
            Association { chrom, ..a }
        })
        .filter_map(|a| {
            let variant = local.reconcile(&a.variant())?;
            Some(a.with_variant(variant))
        })
        .filter(|a| !FILTERED_CODES.contains(&a.code))
        .unique_by(|a| (a.variant().id(), a.trait_code.clone()))
        .collect::<Vec<_>>();
    tracing::debug!(
        "kept {} of {} catalog associations",
        result.len().separate_with_commas(),
        count_raw.separate_with_commas()
    );
    result
}

/// Load associations from the association catalog.
pub async fn load_catalog_hits(
    source: &dyn AssociationSource,
    table: &VariantTable,
    settings: &RetrievalSettings,
) -> Result<Retrieved, anyhow::Error> {
    let regions = catalog_regions(table, settings.pad_bp);
    let Retrieved { hits: raw, failed } = collect_regions(source, &regions, settings).await?;
    let mut hits = align_catalog_hits(raw, table);
    resolve_trait_names(source, &mut hits, settings.fan_out).await;
    let failed = failed
        .iter()
        .map(|region| Region::new(from_catalog_chrom(region.chrom()), region.start(), region.end()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Retrieved { hits, failed })
}

/// Load associations from a custom resource, queried with the locus bounds.
pub async fn load_custom_hits(
    source: &dyn AssociationSource,
    table: &VariantTable,
    settings: &RetrievalSettings,
) -> Result<Retrieved, anyhow::Error> {
    let regions = custom_regions(table, settings.pad_bp);
    let mut result = collect_regions(source, &regions, settings).await?;
    resolve_trait_names(source, &mut result.hits, settings.fan_out).await;
    Ok(result)
}

/// Read associations cached by `write_cache()`.
pub fn read_cache(path: &Path) -> Result<Vec<Association>, anyhow::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| anyhow::anyhow!("could not open cache {}: {}", path.display(), e))?;
    let mut result = Vec::new();
    for record in reader.deserialize() {
        result.push(record.map_err(|e| {
            anyhow::anyhow!("problem reading cache {}: {}", path.display(), e)
        })?);
    }
    Ok(result)
}

/// Write associations to the cache file at `path`.
pub fn write_cache(path: &Path, hits: &[Association]) -> Result<(), anyhow::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(open_write_maybe_gz(path)?);
    for hit in hits {
        writer.serialize(hit)?;
    }
    writer.flush()?;
    Ok(())
}

/// Loci to compute LD for, in order of first appearance.
///
/// The locus chromosome and bounds are taken from the lead variant if it is in the table,
/// otherwise from the first member.
pub fn ld_requests(table: &VariantTable) -> Vec<LocusRequest> {
    table
        .loci()
        .into_iter()
        .filter_map(|(locus_id, members)| {
            let first = &table.rows[*members.first()?];
            let lead = members
                .iter()
                .map(|i| &table.rows[*i])
                .find(|row| row.id == locus_id)
                .unwrap_or(first);
            Some(LocusRequest {
                chrom: lead.variant.chrom.clone(),
                rmin: lead.pos_rmin?,
                rmax: lead.pos_rmax?,
                members: members
                    .iter()
                    .map(|i| LdVariant {
                        id: table.rows[*i].id.clone(),
                        variant: table.rows[*i].variant.clone(),
                    })
                    .collect(),
                locus_id,
            })
        })
        .collect()
}
