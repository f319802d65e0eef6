//! Backend querying the paginated GWAS Catalog summary statistics API.

use std::sync::Arc;

use super::{
    http::{try_request_json, Request, RetryPolicy, Transport},
    Association, AssociationSource, Error, TraitResolver,
};
use crate::{regions::Region, variants::Variant};

pub const SUMMARY_STATS_URL: &str = "https://www.ebi.ac.uk/gwas/summary-statistics/api";

/// Smallest p-value sent as lower bound.
const P_LOWER: &str = "1e-323";

/// Default number of associations per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub struct SummaryStatsSource {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    base_url: String,
    page_size: usize,
    traits: TraitResolver,
}

impl SummaryStatsSource {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        base_url: &str,
        page_size: usize,
        traits: TraitResolver,
    ) -> Self {
        Self {
            transport,
            policy,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
            traits,
        }
    }

    fn first_request(&self, region: &Region, pval: f64) -> Request {
        Request::get(format!(
            "{}/chromosomes/{}/associations",
            &self.base_url,
            region.chrom()
        ))
        .query("p_upper", format!("{:e}", pval))
        .query("p_lower", P_LOWER)
        .query("reveal", "all")
        .query("bp_lower", region.start())
        .query("bp_upper", region.end())
        .query("start", 0)
        .query("size", self.page_size)
    }
}

/// Records of one page; `_embedded.associations` may be an object keyed by index or an array.
fn page_records(page: &serde_json::Value) -> Vec<&serde_json::Value> {
    match page.pointer("/_embedded/associations") {
        Some(serde_json::Value::Object(map)) => map.values().collect(),
        Some(serde_json::Value::Array(values)) => values.iter().collect(),
        _ => Vec::new(),
    }
}

fn next_link(page: &serde_json::Value) -> Option<String> {
    page.pointer("/_links/next/href")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Convert one summary statistics record; `None` if a field is missing.
pub fn parse_record(record: &serde_json::Value) -> Option<Association> {
    let chrom = as_string(record.get("chromosome")?)?;
    let pos = as_f64(record.get("base_pair_location")?)? as i64;
    let ref_allele = as_string(record.get("hm_effect_allele")?)?;
    let alt_allele = as_string(record.get("hm_other_allele")?)?;
    let pval = as_f64(record.get("p_value")?)?;
    let trait_code = as_string(record.get("trait")?.as_array()?.first()?)?;
    let code = as_f64(record.get("hm_code")?)? as i32;
    Some(Association::new(
        Variant::new(chrom, pos, ref_allele, alt_allele),
        pval,
        trait_code,
        code,
    ))
}

#[async_trait::async_trait]
impl AssociationSource for SummaryStatsSource {
    fn name(&self) -> &str {
        "GWAS Catalog summary statistics API"
    }

    async fn fetch(&self, region: &Region, pval: f64) -> Result<Vec<Association>, Error> {
        let mut request = self.first_request(region, pval);
        let mut result = Vec::new();
        let mut pages = 0;
        loop {
            let Some(page) =
                try_request_json(self.transport.as_ref(), &self.policy, &request).await?
            else {
                break;
            };
            pages += 1;
            let records = page_records(&page);
            if records.is_empty() {
                break;
            }
            let total = records.len();
            let parsed = records
                .into_iter()
                .filter_map(parse_record)
                .collect::<Vec<_>>();
            if parsed.len() < total {
                tracing::debug!("skipped incomplete records on page {} of {}", pages, region);
            }
            result.extend(parsed);
            match next_link(&page) {
                Some(href) => request = Request::get(href).query("reveal", "all"),
                None => break,
            }
        }
        tracing::debug!(
            "{}: {} associations on {} pages",
            region,
            result.len(),
            pages
        );
        Ok(result)
    }

    async fn resolve_trait(&self, code: &str) -> String {
        self.traits.resolve(code).await
    }
}
