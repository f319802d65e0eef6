//! Linkage disequilibrium between locus members and known associations.
//!
//! The correlations are computed by `plink` and `ldstore` (see `tool`); this module
//! prepares their input, parses their output and links locus members to associations.

pub mod tool;

use std::{
    collections::HashSet,
    io::BufRead,
    path::Path,
    time::Instant,
};

use indexmap::IndexMap;
use itertools::Itertools;

use self::tool::{ChromosomeBatch, LdConfig, Ldstore, LocusScratch, ToolRunner};
use crate::{
    common::{build_chrom_map, cmp_chrom, io::open_read_maybe_gz},
    variants::Variant,
};

/// Pairwise correlation between two variants, identified by their identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct LdPair {
    pub variant_a: String,
    pub variant_b: String,
    pub r: f64,
}

impl LdPair {
    pub fn r2(&self) -> f64 {
        self.r * self.r
    }

    fn swapped(&self) -> Self {
        Self {
            variant_a: self.variant_b.clone(),
            variant_b: self.variant_a.clone(),
            r: self.r,
        }
    }
}

/// Parse a whitespace-separated `ldstore` table with columns `RSID1`, `RSID2` and
/// `correlation`.
pub fn parse_ld_table<R: BufRead>(reader: R) -> Result<Vec<LdPair>, anyhow::Error> {
    let mut lines = reader.lines();
    let Some(header) = lines.next().transpose()? else {
        return Ok(Vec::new());
    };
    let header = header.split_whitespace().collect::<Vec<_>>();
    let column = |name: &str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| anyhow::anyhow!("LD table lacks column {}", name))
    };
    let (i_a, i_b, i_r) = (column("RSID1")?, column("RSID2")?, column("correlation")?);

    let mut result = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let field = |i: usize| {
            fields.get(i).copied().ok_or_else(|| {
                anyhow::anyhow!("LD table line {} has too few fields", line_no + 2)
            })
        };
        let r = field(i_r)?.parse::<f64>().map_err(|e| {
            anyhow::anyhow!("LD table line {}: invalid correlation: {}", line_no + 2, e)
        })?;
        if !(-1.0..=1.0).contains(&r) {
            tracing::warn!(
                "LD table line {}: skipping correlation {} outside [-1, 1]",
                line_no + 2,
                r
            );
            continue;
        }
        result.push(LdPair {
            variant_a: field(i_a)?.to_string(),
            variant_b: field(i_b)?.to_string(),
            r,
        });
    }
    Ok(result)
}

/// Add the reverse of each pair; duplicates of `(a, b)` are dropped, keeping the first.
pub fn symmetrize(pairs: &[LdPair]) -> Vec<LdPair> {
    pairs
        .iter()
        .flat_map(|pair| [pair.clone(), pair.swapped()])
        .unique_by(|pair| (pair.variant_a.clone(), pair.variant_b.clone()))
        .collect()
}

/// A variant passed to the LD tools, with the identifier it is known under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdVariant {
    pub id: String,
    pub variant: Variant,
}

/// A locus for which LD is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocusRequest {
    pub locus_id: String,
    pub chrom: String,
    pub rmin: i64,
    pub rmax: i64,
    pub members: Vec<LdVariant>,
}

/// Link of a locus member to an association variant in LD.
#[derive(Debug, Clone, PartialEq)]
pub struct LdLink {
    pub locus_id: String,
    /// Identifier of the locus member.
    pub member_id: String,
    /// Identifier of the associated variant as written by the LD tool.
    pub hit_id: String,
    /// Canonical identifier of the associated variant.
    pub hit_canonical_id: String,
    pub r2: f64,
}

/// Keep symmetrized pairs linking a member of `locus` to a variant in `pool`.
pub fn link_pairs(locus: &LocusRequest, pairs: &[LdPair], pool: &[Variant]) -> Vec<LdLink> {
    let member_ids = locus
        .members
        .iter()
        .map(|m| m.id.as_str())
        .collect::<HashSet<_>>();
    let pool_ids = pool
        .iter()
        .map(|v| v.canonical_id())
        .collect::<HashSet<_>>();

    symmetrize(pairs)
        .into_iter()
        .filter(|pair| member_ids.contains(pair.variant_a.as_str()))
        .filter_map(|pair| {
            let canonical = Variant::from_id(&pair.variant_b)?.canonical_id();
            pool_ids.contains(&canonical).then(|| LdLink {
                locus_id: locus.locus_id.clone(),
                member_id: pair.variant_a.clone(),
                hit_id: pair.variant_b.clone(),
                hit_canonical_id: canonical,
                r2: pair.r2(),
            })
        })
        .collect()
}

/// Write the variant list for `ldstore --incl-variants`, sorted by position.
fn write_variant_list(path: &Path, variants: &[LdVariant]) -> Result<(), anyhow::Error> {
    let file = std::fs::File::create(path)
        .map_err(|e| anyhow::anyhow!("could not create {}: {}", path.display(), e))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b' ')
        .from_writer(std::io::BufWriter::new(file));
    writer.write_record(["RSID", "position", "chromosome", "A_allele", "B_allele"])?;
    for v in variants.iter().sorted_by_key(|v| v.variant.pos) {
        let pos = v.variant.pos.to_string();
        writer.write_record([
            v.id.as_str(),
            pos.as_str(),
            v.variant.chrom.as_str(),
            v.variant.ref_allele.as_str(),
            v.variant.alt_allele.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Runs the LD computation for all loci.
pub struct LdOrchestrator<R: ToolRunner> {
    config: LdConfig,
    runner: R,
}

impl<R: ToolRunner> LdOrchestrator<R> {
    pub fn new(config: LdConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Compute LD links of all `loci` to the association variants in `pool`.
    ///
    /// Chromosome subsets are extracted once per chromosome.  Failing tool calls skip the
    /// chromosome or locus; missing tool outputs are errors.  Links are unique by member and
    /// associated variant.
    pub fn run(
        &self,
        loci: &[LocusRequest],
        pool: &[Variant],
    ) -> Result<Vec<LdLink>, anyhow::Error> {
        let chrom_map = build_chrom_map();
        let mut by_chrom: IndexMap<&str, Vec<&LocusRequest>> = IndexMap::new();
        for locus in loci {
            by_chrom.entry(locus.chrom.as_str()).or_default().push(locus);
        }
        by_chrom.sort_by(|lhs, _, rhs, _| cmp_chrom(&chrom_map, lhs, rhs));

        let mut links = Vec::new();
        for (chrom, chrom_loci) in by_chrom {
            let before_chrom = Instant::now();
            tracing::info!("LD for {} loci on chromosome {}", chrom_loci.len(), chrom);
            let Some(batch) = ChromosomeBatch::extract(&self.config, &self.runner, chrom)? else {
                continue;
            };
            for locus in chrom_loci {
                if let Some(locus_links) = self.run_locus(&batch, locus, pool)? {
                    links.extend(locus_links);
                }
            }
            tracing::debug!(
                "... done with chromosome {} in {:?}",
                chrom,
                before_chrom.elapsed()
            );
        }

        Ok(links
            .into_iter()
            .unique_by(|link| (link.member_id.clone(), link.hit_id.clone()))
            .collect())
    }

    /// Compute the links of one locus; `None` if it was skipped.
    fn run_locus(
        &self,
        batch: &ChromosomeBatch,
        locus: &LocusRequest,
        pool: &[Variant],
    ) -> Result<Option<Vec<LdLink>>, anyhow::Error> {
        if locus.members.len() <= 1 {
            tracing::debug!("skipping locus {} with a single variant", &locus.locus_id);
            return Ok(None);
        } else if locus.rmin == locus.rmax {
            tracing::debug!("skipping locus {} with empty range", &locus.locus_id);
            return Ok(None);
        }
        tracing::debug!(
            "locus {}: {} variants in {}:{}-{}",
            &locus.locus_id,
            locus.members.len(),
            batch.chrom(),
            locus.rmin,
            locus.rmax
        );

        let threads = self.config.max_threads.min(locus.members.len()).max(1);
        let scratch = batch.locus_scratch()?;
        let ldstore = Ldstore {
            config: &self.config,
            runner: &self.runner,
        };
        if !ldstore.correlate(
            batch,
            &scratch,
            locus.rmin,
            locus.rmax,
            threads,
            &locus.locus_id,
        )? {
            return Ok(None);
        }

        let in_range = pool
            .iter()
            .filter(|v| v.chrom == locus.chrom && locus.rmin <= v.pos && v.pos <= locus.rmax)
            .cloned()
            .collect::<Vec<_>>();
        write_locus_variants(&scratch, locus, &in_range)?;
        if !ldstore.table(&scratch, &locus.locus_id)? {
            return Ok(None);
        }

        let reader = open_read_maybe_gz(scratch.table())?;
        let pairs = parse_ld_table(reader)?;
        Ok(Some(link_pairs(locus, &pairs, &in_range)))
    }
}

/// Write members and in-range pool variants, unique by identifier.
fn write_locus_variants(
    scratch: &LocusScratch,
    locus: &LocusRequest,
    in_range: &[Variant],
) -> Result<(), anyhow::Error> {
    let variants = locus
        .members
        .iter()
        .cloned()
        .chain(in_range.iter().map(|v| LdVariant {
            id: v.id(),
            variant: v.clone(),
        }))
        .unique_by(|v| v.id.clone())
        .collect::<Vec<_>>();
    write_variant_list(&scratch.variant_list(), &variants)
}
