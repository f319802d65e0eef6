//! Allele lookup for rsIDs via the Ensembl variation REST API.

use std::{collections::HashMap, sync::Arc};

use itertools::Itertools;

use super::http::{try_request_json, Request, RetryPolicy, Transport};

pub const ENSEMBL_VARIATION_URL: &str = "https://rest.ensembl.org/variation/human";

/// Number of rsIDs per POST request.
pub const CHUNK_SIZE: usize = 200;

/// Alleles of an rsID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsidAlleles {
    pub ref_allele: String,
    pub alt_allele: String,
}

/// Client for the Ensembl variation endpoint.
#[derive(Clone)]
pub struct EnsemblClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    url: String,
}

impl EnsemblClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self::with_url(transport, policy, ENSEMBL_VARIATION_URL)
    }

    pub fn with_url(transport: Arc<dyn Transport>, policy: RetryPolicy, url: &str) -> Self {
        Self {
            transport,
            policy,
            url: url.to_string(),
        }
    }

    /// Look up alleles of `rsids`.
    ///
    /// Chunks that fail are logged and skipped, so the result may lack some rsIDs.
    pub async fn lookup(&self, rsids: &[String]) -> HashMap<String, RsidAlleles> {
        let rsids = rsids.iter().unique().collect::<Vec<_>>();
        let mut result = HashMap::new();
        for chunk in rsids.chunks(CHUNK_SIZE) {
            let body = serde_json::json!({ "ids": chunk });
            let request = Request::post_json(&self.url, &body);
            match try_request_json(self.transport.as_ref(), &self.policy, &request).await {
                Ok(Some(json)) => result.extend(parse_variation_response(&json)),
                Ok(None) => tracing::warn!(
                    "Ensembl returned no variants; matches for the following rsIDs may be \
                    missing: {}",
                    chunk.iter().join(", ")
                ),
                Err(e) => tracing::warn!(
                    "Ensembl lookup failed ({}); matches for the following rsIDs may be \
                    missing: {}",
                    e,
                    chunk.iter().join(", ")
                ),
            }
        }
        result
    }
}

/// Parse the response keyed by rsID; `allele_string` `"X/Y"` yields alt `X` and ref `Y`.
pub fn parse_variation_response(json: &serde_json::Value) -> Vec<(String, RsidAlleles)> {
    let Some(entries) = json.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(rsid, entry)| {
            let allele_string = entry
                .get("mappings")?
                .as_array()?
                .first()?
                .get("allele_string")?
                .as_str()?;
            let mut alleles = allele_string.split('/');
            let (alt_allele, ref_allele) = (alleles.next()?, alleles.next()?);
            Some((
                rsid.clone(),
                RsidAlleles {
                    ref_allele: ref_allele.to_string(),
                    alt_allele: alt_allele.to_string(),
                },
            ))
        })
        .collect()
}
