//! GWAS Catalog download API backend and the parsing of GWAS Catalog association tables.

use std::{collections::HashMap, io::Read, sync::Arc};

use super::{
    ensembl::{EnsemblClient, RsidAlleles},
    format_pval_filter,
    http::{try_request, Fetched, Request, RetryPolicy, Transport},
    parse_efo, split_traits, Association, AssociationSource, Error, TraitResolver, CATALOG_CODE,
};
use crate::{
    regions::Region,
    variants::{parse_position, Variant},
};

pub const DOWNLOAD_URL: &str = "https://www.ebi.ac.uk/gwas/api/search/downloads";

/// One row of a GWAS Catalog association table, as downloaded or dumped.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct CatalogRow {
    #[serde(rename = "SNPS")]
    pub snps: String,
    #[serde(rename = "CHR_ID")]
    pub chrom: String,
    #[serde(rename = "CHR_POS")]
    pub pos: String,
    #[serde(rename = "P-VALUE")]
    pub pval: String,
    #[serde(rename = "PVALUE_MLOG", default)]
    pub pval_mlog: String,
    #[serde(rename = "MAPPED_TRAIT", default)]
    pub mapped_trait: String,
    #[serde(rename = "MAPPED_TRAIT_URI", default)]
    pub mapped_trait_uri: String,
    #[serde(rename = "STUDY", default)]
    pub study: String,
    #[serde(rename = "LINK", default)]
    pub link: String,
}

impl CatalogRow {
    /// Position; `None` for multi-position (`;`) and interaction (`x`) rows.
    pub fn position(&self) -> Option<i64> {
        if self.pos.contains(';') || self.pos.contains('x') {
            None
        } else {
            parse_position(self.pos.trim())
        }
    }

    pub fn p_value(&self) -> Option<f64> {
        self.pval.trim().parse().ok()
    }

    /// Whether the row describes a variant-by-variant interaction.
    pub fn is_interaction(&self) -> bool {
        self.snps.contains(" x ")
    }

    /// Apply the region and p-value filter.
    pub fn is_hit(&self, region: &Region, pval: f64) -> bool {
        !self.is_interaction()
            && self.chrom == region.chrom()
            && self
                .position()
                .map(|pos| region.contains(&self.chrom, pos))
                .unwrap_or(false)
            && self.p_value().map(|p| p <= pval).unwrap_or(false)
    }
}

/// Read a tab-separated GWAS Catalog association table.
pub fn read_catalog_rows<R: Read>(reader: R) -> Result<Vec<CatalogRow>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Turn catalog rows into associations using the looked-up alleles.
///
/// Rows without alleles are dropped and multi-trait rows are split into one association
/// per trait.  With `keep_names`, the catalog's trait names are kept, otherwise names are
/// left for resolution.
pub fn rows_to_associations(
    rows: &[CatalogRow],
    alleles: &HashMap<String, RsidAlleles>,
    keep_names: bool,
) -> Vec<Association> {
    let mut result = Vec::new();
    for row in rows {
        let (Some(pos), Some(pval), Some(rsid_alleles)) =
            (row.position(), row.p_value(), alleles.get(&row.snps))
        else {
            continue;
        };
        let variant = Variant::new(
            row.chrom.clone(),
            pos,
            rsid_alleles.ref_allele.clone(),
            rsid_alleles.alt_allele.clone(),
        );
        for (name, uri) in split_traits(&row.mapped_trait, &row.mapped_trait_uri) {
            let mut association =
                Association::new(variant.clone(), pval, parse_efo(&uri), CATALOG_CODE);
            if keep_names {
                association.trait_name = Some(name);
                association.pval_mlog = row.pval_mlog.trim().parse().ok();
                association.study = Some(row.study.clone()).filter(|s| !s.is_empty());
                association.study_link = Some(row.link.clone()).filter(|s| !s.is_empty());
            }
            result.push(association);
        }
    }
    result
}

/// The rsIDs of rows to look up, without interaction rows.
pub fn rsids_of(rows: &[CatalogRow]) -> Vec<String> {
    rows.iter()
        .filter(|row| !row.is_interaction())
        .map(|row| row.snps.clone())
        .collect()
}

/// Backend querying the GWAS Catalog download API.
pub struct GwasApiSource {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    url: String,
    ensembl: EnsemblClient,
    traits: TraitResolver,
}

impl GwasApiSource {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        url: &str,
        ensembl: EnsemblClient,
        traits: TraitResolver,
    ) -> Self {
        Self {
            transport,
            policy,
            url: url.to_string(),
            ensembl,
            traits,
        }
    }

    fn request(&self, region: &Region, pval: f64) -> Request {
        Request::get(&self.url)
            .query(
                "q",
                format!(
                    "chromosomeName: {} AND chromosomePosition:[ {} TO {}]",
                    region.chrom(),
                    region.start(),
                    region.end()
                ),
            )
            .query("pvalfilter", format_pval_filter(pval))
            .query("orfilter", "")
            .query("betafilter", "")
            .query("datefilter", "")
            .query("genomicfilter", "")
            .query("genotypingfilter[]", "")
            .query("traitfilter[]", "")
            .query("dateaddedfilter", "")
            .query("facet", "association")
            .query("efo", "true")
    }
}

#[async_trait::async_trait]
impl AssociationSource for GwasApiSource {
    fn name(&self) -> &str {
        "GWAS Catalog download API"
    }

    async fn fetch(&self, region: &Region, pval: f64) -> Result<Vec<Association>, Error> {
        let request = self.request(region, pval);
        let body = match try_request(self.transport.as_ref(), &self.policy, &request).await? {
            Fetched::NotFound => return Ok(Vec::new()),
            Fetched::Found(response) => response.body,
        };
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = read_catalog_rows(body.as_bytes())?
            .into_iter()
            .filter(|row| row.is_hit(region, pval))
            .collect::<Vec<_>>();
        tracing::debug!("{}: {} catalog rows", region, rows.len());
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let alleles = self.ensembl.lookup(&rsids_of(&rows)).await;
        Ok(rows_to_associations(&rows, &alleles, false))
    }

    async fn resolve_trait(&self, code: &str) -> String {
        self.traits.resolve(code).await
    }
}
