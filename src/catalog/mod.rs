//! Retrieval of known associations from association catalogs.
//!
//! All backends implement `AssociationSource`; the concrete backend is chosen on the
//! command line.

pub mod custom;
pub mod ensembl;
pub mod gwas_api;
pub mod http;
pub mod local_db;
pub mod summary_stats;

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use itertools::Itertools;

use crate::{regions::Region, variants::Variant};

use self::http::{try_request_json, Request, RetryPolicy, Transport};

/// Harmonization code assigned to rows derived from the GWAS Catalog itself.
pub const CATALOG_CODE: i32 = 20;

/// Harmonization codes of summary statistics that are not trusted.
pub const FILTERED_CODES: [i32; 6] = [9, 14, 15, 16, 17, 18];

/// Endpoint resolving EFO trait codes to trait names.
pub const EFO_TRAITS_URL: &str = "https://www.ebi.ac.uk/gwas/rest/api/efoTraits";

/// Trait name used when a code cannot be resolved.
pub const UNKNOWN_TRAIT: &str = "NA";

/// Errors raised by the catalog backends.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The server kept failing; distinct from "no results".
    #[error("request to {url} failed after {attempts} attempts: {reason}")]
    ResponseFailure {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("problem with tabular data: {0}")]
    Csv(#[from] csv::Error),
}

/// A known association of a variant with a trait.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Association {
    pub chrom: String,
    pub pos: i64,
    #[serde(rename = "ref")]
    pub ref_allele: String,
    #[serde(rename = "alt")]
    pub alt_allele: String,
    pub pval: f64,
    /// Trait code, e.g. an EFO identifier.
    #[serde(rename = "trait")]
    pub trait_code: String,
    pub trait_name: Option<String>,
    /// Harmonization code.
    pub code: i32,
    #[serde(default)]
    pub pval_mlog: Option<f64>,
    #[serde(default)]
    pub study: Option<String>,
    #[serde(default)]
    pub study_link: Option<String>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub se: Option<f64>,
    #[serde(default)]
    pub study_doi: Option<String>,
}

impl Association {
    /// Create with the mandatory fields only.
    pub fn new(variant: Variant, pval: f64, trait_code: impl Into<String>, code: i32) -> Self {
        Self {
            chrom: variant.chrom,
            pos: variant.pos,
            ref_allele: variant.ref_allele,
            alt_allele: variant.alt_allele,
            pval,
            trait_code: trait_code.into(),
            trait_name: None,
            code,
            pval_mlog: None,
            study: None,
            study_link: None,
            beta: None,
            se: None,
            study_doi: None,
        }
    }

    pub fn variant(&self) -> Variant {
        Variant::new(
            self.chrom.clone(),
            self.pos,
            self.ref_allele.clone(),
            self.alt_allele.clone(),
        )
    }

    /// Replace the variant coordinates.
    pub fn with_variant(self, variant: Variant) -> Self {
        Self {
            chrom: variant.chrom,
            pos: variant.pos,
            ref_allele: variant.ref_allele,
            alt_allele: variant.alt_allele,
            ..self
        }
    }
}

/// The backend to query for known associations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Backend {
    /// Local dump of the GWAS Catalog.
    Local,
    /// GWAS Catalog download API.
    #[default]
    Gwas,
    /// GWAS Catalog summary statistics API.
    SummaryStats,
}

/// A source of known associations.
#[async_trait::async_trait]
pub trait AssociationSource: Send + Sync {
    /// Human readable name for log messages.
    fn name(&self) -> &str;

    /// Upper bound on concurrent `fetch()` calls.
    fn max_concurrency(&self) -> usize {
        usize::MAX
    }

    /// Fetch associations in `region` with p-value at or below `pval`.
    ///
    /// "Nothing found" is an empty list, hard failures are errors.
    async fn fetch(&self, region: &Region, pval: f64) -> Result<Vec<Association>, Error>;

    /// Resolve a trait code to a display name, `"NA"` if that fails.
    async fn resolve_trait(&self, code: &str) -> String;
}

/// Resolves EFO codes through the GWAS Catalog REST API.
#[derive(Clone)]
pub struct TraitResolver {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    base_url: String,
}

impl TraitResolver {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self::with_base_url(transport, policy, EFO_TRAITS_URL)
    }

    pub fn with_base_url(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        base_url: &str,
    ) -> Self {
        Self {
            transport,
            policy,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn resolve(&self, code: &str) -> String {
        let request = Request::get(format!("{}/{}", &self.base_url, code));
        match try_request_json(self.transport.as_ref(), &self.policy, &request).await {
            Ok(Some(json)) => match json.get("trait").and_then(|v| v.as_str()) {
                Some(name) => name.to_string(),
                None => {
                    tracing::warn!("response for trait {} has no trait name", code);
                    UNKNOWN_TRAIT.to_string()
                }
            },
            Ok(None) => {
                tracing::info!("trait {} not found in GWAS Catalog", code);
                UNKNOWN_TRAIT.to_string()
            }
            Err(e) => {
                tracing::warn!("could not resolve trait {}: {}", code, e);
                UNKNOWN_TRAIT.to_string()
            }
        }
    }
}

/// Extract the trait code from a trait URI, i.e., its last path segment.
pub fn parse_efo(uri: &str) -> String {
    let uri = uri.trim();
    if uri.is_empty() {
        "NAN".to_string()
    } else {
        uri.rsplit('/').next().unwrap_or(uri).to_string()
    }
}

/// Split comma-separated trait names and URIs into `(name, uri)` pairs.
pub fn split_traits(names: &str, uris: &str) -> Vec<(String, String)> {
    if uris.contains(',') {
        names
            .split(',')
            .map(str::trim)
            .zip(uris.split(',').map(str::trim))
            .map(|(name, uri)| (name.to_string(), uri.to_string()))
            .collect()
    } else {
        vec![(names.to_string(), uris.to_string())]
    }
}

/// Write a p-value threshold as integer mantissa and exponent, e.g. `1.2e-8` as `12e-9`.
///
/// Values at or below zero become `0`, values at or above one become `1`.
pub fn format_pval_filter(pval: f64) -> String {
    if pval <= 0.0 {
        return "0".to_string();
    } else if pval >= 1.0 {
        return "1".to_string();
    }
    let sci = format!("{:.6e}", pval);
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let digits = mantissa.trim_end_matches('0').replace('.', "");
    let exponent = exponent.parse::<i32>().unwrap_or(0) - digits.len() as i32 + 1;
    format!("{}e{}", digits, exponent)
}

/// Fetch all `regions` from `source`, with at most `fan_out` calls in flight.
///
/// Results are returned in the order of `regions`; each region succeeds or fails on its own.
pub async fn fetch_regions(
    source: &dyn AssociationSource,
    regions: &[Region],
    pval: f64,
    fan_out: usize,
) -> Vec<(Region, Result<Vec<Association>, Error>)> {
    let limit = fan_out.max(1).min(source.max_concurrency().max(1));
    tracing::debug!(
        "fetching {} regions from {} with {} concurrent requests",
        regions.len(),
        source.name(),
        limit
    );
    let mut results = futures::stream::iter(regions.iter().enumerate())
        .map(|(i, region)| async move { (i, source.fetch(region, pval).await) })
        .buffer_unordered(limit)
        .collect::<Vec<_>>()
        .await;
    results.sort_by_key(|(i, _)| *i);
    results
        .into_iter()
        .map(|(i, result)| (regions[i].clone(), result))
        .collect()
}

/// Fill in trait names of associations lacking one, resolving each code once.
pub async fn resolve_trait_names(
    source: &dyn AssociationSource,
    associations: &mut [Association],
    fan_out: usize,
) {
    let codes = associations
        .iter()
        .filter(|a| a.trait_name.is_none())
        .map(|a| a.trait_code.clone())
        .unique()
        .collect::<Vec<_>>();
    if codes.is_empty() {
        return;
    }
    tracing::debug!("resolving {} trait names", codes.len());
    let names = futures::stream::iter(codes)
        .map(|code| async move {
            let name = source.resolve_trait(&code).await;
            (code, name)
        })
        .buffer_unordered(fan_out.max(1))
        .collect::<HashMap<_, _>>()
        .await;
    for association in associations.iter_mut() {
        if association.trait_name.is_none() {
            association.trait_name = names.get(&association.trait_code).cloned();
        }
    }
}
