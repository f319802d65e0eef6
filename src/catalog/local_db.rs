//! Backend serving associations from a local dump of the GWAS Catalog.

use std::{collections::HashMap, path::Path, time::Instant};

use thousands::Separable;

use super::{
    ensembl::EnsemblClient,
    gwas_api::{read_catalog_rows, rows_to_associations, rsids_of, CatalogRow},
    Association, AssociationSource, Error, TraitResolver,
};
use crate::{
    common::io::{open_read_maybe_gz, Source},
    err::AppError,
    regions::Region,
};

/// Local GWAS Catalog dump, loaded into memory and indexed by chromosome.
pub struct LocalCatalogSource {
    /// Rows per chromosome, sorted by position.
    rows: HashMap<String, Vec<(i64, CatalogRow)>>,
    ensembl: EnsemblClient,
    traits: TraitResolver,
}

impl LocalCatalogSource {
    /// Load the dump from `source`.
    ///
    /// # Errors
    ///
    /// If `source` is absent or the file cannot be parsed.
    pub fn from_source(
        source: &Source,
        ensembl: EnsemblClient,
        traits: TraitResolver,
    ) -> Result<Self, anyhow::Error> {
        let path = source
            .path()
            .ok_or_else(|| anyhow::anyhow!("the local GWAS Catalog path was not given"))?;
        let rows = load_rows(path)?;
        Ok(Self::from_rows(rows, ensembl, traits))
    }

    /// Build from parsed rows, dropping rows without position or p-values.
    pub fn from_rows(rows: Vec<CatalogRow>, ensembl: EnsemblClient, traits: TraitResolver) -> Self {
        let mut by_chrom: HashMap<String, Vec<(i64, CatalogRow)>> = HashMap::new();
        for row in rows {
            let valid = row.p_value().is_some() && row.pval_mlog.trim().parse::<f64>().is_ok();
            match row.position() {
                Some(pos) if valid && !row.chrom.is_empty() => {
                    by_chrom.entry(row.chrom.clone()).or_default().push((pos, row))
                }
                _ => continue,
            }
        }
        for rows in by_chrom.values_mut() {
            rows.sort_by_key(|(pos, _)| *pos);
        }
        Self {
            rows: by_chrom,
            ensembl,
            traits,
        }
    }

    /// Rows of `region` passing the p-value filter.
    fn rows_in(&self, region: &Region, pval: f64) -> Vec<CatalogRow> {
        let Some(rows) = self.rows.get(region.chrom()) else {
            return Vec::new();
        };
        let first = rows.partition_point(|(pos, _)| *pos < region.start());
        rows[first..]
            .iter()
            .take_while(|(pos, _)| *pos <= region.end())
            .filter(|(_, row)| row.is_hit(region, pval))
            .map(|(_, row)| row.clone())
            .collect()
    }
}

fn load_rows(path: &Path) -> Result<Vec<CatalogRow>, anyhow::Error> {
    let before_loading = Instant::now();
    tracing::info!("loading local GWAS Catalog from {}", path.display());
    let reader = open_read_maybe_gz(path).map_err(|_| AppError::MissingResource {
        path: path.to_path_buf(),
        hint: "argument to --local-gwascatalog not found: does the file exist?".to_string(),
    })?;
    let rows = read_catalog_rows(reader)
        .map_err(|e| anyhow::anyhow!("could not parse {}: {}", path.display(), e))?;
    tracing::info!(
        "... loaded {} rows in {:?}",
        rows.len().separate_with_commas(),
        before_loading.elapsed()
    );
    Ok(rows)
}

#[async_trait::async_trait]
impl AssociationSource for LocalCatalogSource {
    fn name(&self) -> &str {
        "local GWAS Catalog"
    }

    fn max_concurrency(&self) -> usize {
        1
    }

    async fn fetch(&self, region: &Region, pval: f64) -> Result<Vec<Association>, Error> {
        let rows = self.rows_in(region, pval);
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let alleles = self.ensembl.lookup(&rsids_of(&rows)).await;
        Ok(rows_to_associations(&rows, &alleles, true))
    }

    async fn resolve_trait(&self, code: &str) -> String {
        self.traits.resolve(code).await
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;

    use super::LocalCatalogSource;
    use crate::{
        catalog::{
            ensembl::EnsemblClient,
            http::{testing::ScriptedTransport, Response, RetryPolicy},
            AssociationSource, TraitResolver,
        },
        common::io::Source,
        regions::Region,
    };

    const DUMP: &str = "SNPS\tCHR_ID\tCHR_POS\tP-VALUE\tPVALUE_MLOG\tMAPPED_TRAIT\tMAPPED_TRAIT_URI\tSTUDY\tLINK\n\
        rs1\t1\t150\t1E-10\t10\tbody mass index\thttp://x/EFO_1\tGWAS of BMI\twww.ncbi.nlm.nih.gov/pubmed/1\n\
        rs2\t1\t250\t1E-10\t10\theight\thttp://x/EFO_2\tGWAS of height\twww.ncbi.nlm.nih.gov/pubmed/2\n\
        rs3\t1\t1000\t1E-10\t10\theight\thttp://x/EFO_2\tGWAS of height\twww.ncbi.nlm.nih.gov/pubmed/2\n\
        rs4\t1\t160\t0.5\t0.3\theight\thttp://x/EFO_2\tGWAS of height\twww.ncbi.nlm.nih.gov/pubmed/2\n\
        rs5\t1\t170\tNR\tNR\theight\thttp://x/EFO_2\tGWAS of height\twww.ncbi.nlm.nih.gov/pubmed/2\n\
        rs6\t2\t150\t1E-10\t10\theight\thttp://x/EFO_2\tGWAS of height\twww.ncbi.nlm.nih.gov/pubmed/2\n";

    fn source() -> (Arc<ScriptedTransport>, LocalCatalogSource) {
        let transport = Arc::new(ScriptedTransport::always(
            200,
            &serde_json::json!({
                "rs1": {"mappings": [{"allele_string": "A/G"}]},
                "rs2": {"mappings": [{"allele_string": "C/T"}]},
            })
            .to_string(),
        ));
        let policy = RetryPolicy {
            max_attempts: 1,
            delay: Duration::ZERO,
        };
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("gwas_catalog.tsv");
        std::fs::write(&path, DUMP).unwrap();
        let source = LocalCatalogSource::from_source(
            &Source::new(path.to_str(), "local GWAS Catalog").unwrap(),
            EnsemblClient::with_url(transport.clone(), policy.clone(), "http://ensembl"),
            TraitResolver::with_base_url(transport.clone(), policy, "http://efo"),
        )
        .unwrap();
        (transport, source)
    }

    #[tokio::test]
    async fn fetch() {
        let (transport, source) = source();

        let res = source
            .fetch(&Region::new("1", 100, 300).unwrap(), 5e-8)
            .await
            .unwrap();

        assert_eq!(transport.count(), 1);
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].pos, 150);
        assert_eq!(res[0].trait_name.as_deref(), Some("body mass index"));
        assert_eq!(res[0].pval_mlog, Some(10.0));
        assert_eq!(res[0].study.as_deref(), Some("GWAS of BMI"));
        assert_eq!(
            res[1].study_link.as_deref(),
            Some("www.ncbi.nlm.nih.gov/pubmed/2")
        );
        assert_eq!(source.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn fetch_empty_region() {
        let (transport, source) = source();

        let res = source
            .fetch(&Region::new("3", 100, 300).unwrap(), 5e-8)
            .await
            .unwrap();

        assert!(res.is_empty());
        assert_eq!(transport.count(), 0);
    }

    #[test]
    fn from_source_absent() {
        let (transport, _) = source();
        let policy = RetryPolicy::default();
        let res = LocalCatalogSource::from_source(
            &Source::Absent,
            EnsemblClient::new(transport.clone(), policy.clone()),
            TraitResolver::new(transport, policy),
        );
        assert!(res.is_err());
    }
}
