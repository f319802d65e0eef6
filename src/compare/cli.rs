//! Command line interface of `compare`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use itertools::Itertools;
use thousands::Separable;

use super::{
    ld_requests, load_catalog_hits, load_custom_hits, read_cache,
    report::{join_ld_report, join_report, write_ld_report, write_report},
    top_level::{build_top_level, write_top_level, GroupingMethod, TopLevelSettings},
    write_cache, CompareStyle, RetrievalSettings, Retrieved,
};
use crate::{
    catalog::{
        custom::CustomSource,
        ensembl::EnsemblClient,
        gwas_api::{GwasApiSource, DOWNLOAD_URL},
        http::{ReqwestTransport, RetryPolicy, RetryPolicyBuilder, Transport},
        local_db::LocalCatalogSource,
        summary_stats::{SummaryStatsSource, DEFAULT_PAGE_SIZE, SUMMARY_STATS_URL},
        Association, AssociationSource, Backend, TraitResolver,
    },
    common::{
        io::{expand_path, require_file, Source},
        trace_rss_now,
    },
    err::ArgError,
    ld::{
        tool::{LdConfigBuilder, SystemRunner},
        LdLink, LdOrchestrator,
    },
    variants::{ColumnNames, VariantTable, DEFAULT_COLUMN_LABELS},
};

/// Name of the association cache file, prepended with the prefix.
const CACHE_FILE_NAME: &str = "gwas_out_mapping.tsv";

/// Command line arguments for `compare` sub command.
#[derive(Parser, Debug, Clone)]
#[command(
    about = "Compare significant variants to known associations",
    long_about = None
)]
pub struct Args {
    /// Path to the TSV file with significant variants.
    pub path_input: String,

    /// Significance threshold for the strict group.
    #[arg(long, default_value_t = 5e-8)]
    pub sign_threshold: f64,
    /// Definition of the strict group in the top-level report.
    #[arg(long, value_enum, default_value_t = GroupingMethod::Simple)]
    pub grouping_method: GroupingMethod,
    /// Sources to compare against.
    #[arg(long, value_enum, default_value_t = CompareStyle::Gwascatalog)]
    pub compare_style: CompareStyle,
    /// Path to a bgzipped and indexed custom association resource.
    #[arg(long)]
    pub custom_dataresource: Option<String>,

    /// Compute LD between the input variants and the associations.
    #[arg(long, default_value_t = false)]
    pub check_for_ld: bool,
    /// Memory for `plink` in MB.
    #[arg(long, default_value_t = 12000)]
    pub plink_memory: usize,
    /// PLINK binary fileset prefix of the LD panel (path without `.bed`).
    #[arg(long)]
    pub ld_panel_path: Option<String>,
    /// Number of threads for `ldstore`.
    #[arg(long, default_value_t = 4)]
    pub ldstore_threads: usize,
    /// r^2 threshold for the LD report.
    #[arg(long, default_value_t = 0.9)]
    pub ld_threshold: f64,
    /// Path to the `plink` executable.
    #[arg(long, default_value = "plink")]
    pub plink_bin: String,
    /// Path to the `ldstore` executable.
    #[arg(long, default_value = "ldstore")]
    pub ldstore_bin: String,

    /// Prefix of output and scratch files.
    #[arg(long, default_value = "")]
    pub prefix: String,
    /// Path of the report.
    #[arg(long, default_value = "report_out.tsv")]
    pub report_out: String,
    /// Path of the LD report.
    #[arg(long, default_value = "ld_report_out.tsv")]
    pub ld_report_out: String,
    /// Path of the top-level report.
    #[arg(long, default_value = "top_report.tsv")]
    pub top_report_out: String,

    /// p-value threshold for catalog queries.
    #[arg(long, default_value_t = 5e-8)]
    pub gwascatalog_pval: f64,
    /// Padding around each variant for catalog queries in kbp.
    #[arg(long, default_value_t = 25)]
    pub gwascatalog_width_kb: i64,
    /// Number of concurrent catalog queries.
    #[arg(long, default_value_t = 4)]
    pub gwascatalog_threads: usize,
    /// Catalog backend to query.
    #[arg(long, value_enum, default_value_t = Backend::Gwas)]
    pub db: Backend,
    /// Path to the local GWAS Catalog dump, required with `--db local`.
    #[arg(long)]
    pub local_gwascatalog: Option<String>,
    /// Store catalog results in the cache file and read them from there if it exists.
    #[arg(long, default_value_t = false)]
    pub cache_gwas: bool,
    /// Fail if any catalog query fails instead of continuing without its region.
    #[arg(long, default_value_t = false)]
    pub abort_on_query_failure: bool,

    /// Number of requests per call before giving up.
    #[arg(long, default_value_t = 5)]
    pub retry_attempts: usize,
    /// Pause between two requests of a call in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub retry_delay_ms: u64,
    /// Timeout of a single request in seconds.
    #[arg(long, default_value_t = 60)]
    pub request_timeout: u64,
    /// Page size for the summary statistics API.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// Input column names of chromosome, position, ref, alt, p-value, beta, AF, AF in cases
    /// and AF in controls.
    #[arg(
        long,
        num_args = 9,
        value_names = ["CHROM", "POS", "REF", "ALT", "PVAL", "BETA", "AF", "AF_CASE", "AF_CONTROL"],
        default_values = DEFAULT_COLUMN_LABELS
    )]
    pub column_labels: Vec<String>,
    /// Minimal r^2 to the lead for the strict group with `--grouping-method ld`.
    #[arg(long, default_value_t = 0.5)]
    pub strict_group_r2: f64,
    /// Trait codes reported in separate top-level columns.
    #[arg(long, num_args = 1..)]
    pub efo_codes: Vec<String>,
}

/// Paths of the output files, prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputPaths {
    report: PathBuf,
    ld_report: PathBuf,
    top_report: PathBuf,
    cache: PathBuf,
}

impl OutputPaths {
    fn new(args: &Args) -> Self {
        let prefix = if args.prefix.is_empty() {
            String::new()
        } else {
            format!("{}.", &args.prefix)
        };
        let path = |name: &str| expand_path(&format!("{}{}", &prefix, name));
        Self {
            report: path(&args.report_out),
            ld_report: path(&args.ld_report_out),
            top_report: path(&args.top_report_out),
            cache: path(CACHE_FILE_NAME),
        }
    }
}

/// Check combinations of arguments before doing any work.
fn validate(args: &Args, custom: &Source, local_catalog: &Source) -> Result<(), ArgError> {
    if args.compare_style.uses_custom() && !custom.is_configured() {
        return Err(ArgError::MissingCustomResource(args.compare_style.to_string()));
    }
    if args.compare_style.uses_catalog()
        && args.db == Backend::Local
        && !local_catalog.is_configured()
    {
        return Err(ArgError::MissingLocalCatalog);
    }
    if args.check_for_ld && args.ld_panel_path.is_none() {
        return Err(ArgError::MissingLdPanel);
    }
    Ok(())
}

fn retry_policy(args: &Args) -> Result<RetryPolicy, anyhow::Error> {
    Ok(RetryPolicyBuilder::default()
        .max_attempts(args.retry_attempts)
        .delay(Duration::from_millis(args.retry_delay_ms))
        .build()?)
}

/// Construct the catalog backend selected by `--db`.
fn catalog_source(
    args: &Args,
    local_catalog: &Source,
) -> Result<Box<dyn AssociationSource>, anyhow::Error> {
    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new(Duration::from_secs(args.request_timeout))?);
    let policy = retry_policy(args)?;
    let traits = TraitResolver::new(transport.clone(), policy.clone());
    let ensembl = || EnsemblClient::new(transport.clone(), policy.clone());

    Ok(match args.db {
        Backend::Local => Box::new(LocalCatalogSource::from_source(
            local_catalog,
            ensembl(),
            traits,
        )?),
        Backend::Gwas => Box::new(GwasApiSource::new(
            transport.clone(),
            policy.clone(),
            DOWNLOAD_URL,
            ensembl(),
            traits,
        )),
        Backend::SummaryStats => Box::new(SummaryStatsSource::new(
            transport.clone(),
            policy.clone(),
            SUMMARY_STATS_URL,
            args.page_size,
            traits,
        )),
    })
}

/// Load the associations from all sources selected by `--compare-style`.
async fn load_hits(
    args: &Args,
    table: &VariantTable,
    custom: &Source,
    local_catalog: &Source,
    cache_path: &Path,
) -> Result<Retrieved, anyhow::Error> {
    let settings = RetrievalSettings {
        pval: args.gwascatalog_pval,
        pad_bp: args.gwascatalog_width_kb * 1000,
        fan_out: args.gwascatalog_threads,
        abort_on_failure: args.abort_on_query_failure,
    };

    let mut result = Retrieved::default();
    if args.compare_style.uses_custom() {
        let source = CustomSource::from_source(custom)?;
        result.extend(load_custom_hits(&source, table, &settings).await?);
    }
    if args.compare_style.uses_catalog() {
        if args.cache_gwas && cache_path.exists() {
            tracing::info!("reading cached associations from {}", cache_path.display());
            result.hits.extend(read_cache(cache_path)?);
        } else {
            let source = catalog_source(args, local_catalog)?;
            let catalog = load_catalog_hits(source.as_ref(), table, &settings).await?;
            if args.cache_gwas && catalog.failed.is_empty() {
                write_cache(cache_path, &catalog.hits)?;
            } else if args.cache_gwas {
                tracing::warn!(
                    "{} catalog regions failed, not writing cache {}",
                    catalog.failed.len(),
                    cache_path.display()
                );
            }
            result.extend(catalog);
        }
    }
    Ok(result)
}

/// Run the LD computation for all loci against the association variants.
fn compute_ld(
    args: &Args,
    table: &VariantTable,
    hits: &[Association],
) -> Result<Vec<LdLink>, anyhow::Error> {
    let panel = expand_path(args.ld_panel_path.as_deref().unwrap_or_default());
    require_file(
        &PathBuf::from(format!("{}.bed", panel.display())),
        "LD panel not found: give the PLINK fileset without the .bed suffix",
    )?;
    let config = LdConfigBuilder::default()
        .plink_bin(args.plink_bin.clone())
        .ldstore_bin(args.ldstore_bin.clone())
        .panel(panel)
        .plink_memory_mb(args.plink_memory)
        .max_threads(args.ldstore_threads)
        .ld_threshold(args.ld_threshold)
        .prefix(args.prefix.clone())
        .build()?;
    let pool = hits
        .iter()
        .map(Association::variant)
        .unique()
        .collect::<Vec<_>>();
    LdOrchestrator::new(config, SystemRunner).run(&ld_requests(table), &pool)
}

/// Main entry point for `compare` sub command.
pub fn run(common_args: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    let before_anything = Instant::now();
    tracing::info!("Starting 'compare'");
    tracing::info!("  common_args = {:?}", &common_args);
    tracing::info!("  args = {:?}", &args);

    let columns = ColumnNames::from_labels(&args.column_labels)?;
    let custom = Source::new(args.custom_dataresource.as_deref(), "custom resource")?;
    let local_catalog = Source::new(args.local_gwascatalog.as_deref(), "local GWAS Catalog")?;
    validate(args, &custom, &local_catalog)?;
    let paths = OutputPaths::new(args);

    tracing::info!("Loading input variants...");
    let before_loading = Instant::now();
    let table = VariantTable::from_path(expand_path(&args.path_input), &columns)?;
    tracing::info!(
        "... loaded {} variants in {:?}",
        table.rows.len().separate_with_commas(),
        before_loading.elapsed()
    );
    if table.is_empty() {
        tracing::warn!("no variants in {}, no reports written", &args.path_input);
        return Ok(());
    }
    if args.check_for_ld && !table.has_grouping() {
        return Err(ArgError::LdWithoutGrouping.into());
    }

    tracing::info!("Retrieving associations...");
    let before_retrieval = Instant::now();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("could not start async runtime: {}", e))?;
    let Retrieved { hits, failed } = runtime.block_on(load_hits(
        args,
        &table,
        &custom,
        &local_catalog,
        &paths.cache,
    ))?;
    tracing::info!(
        "... retrieved {} associations in {:?}",
        hits.len().separate_with_commas(),
        before_retrieval.elapsed()
    );
    trace_rss_now();
    if !failed.is_empty() {
        tracing::warn!(
            "{} query regions failed, their variants are marked as FAILED in the report",
            failed.len()
        );
    } else if hits.is_empty() {
        tracing::warn!("no associations found, report will be incomplete");
    }

    tracing::info!("Writing report...");
    let report_rows = join_report(&table, &hits);
    write_report(&paths.report, &table, &hits, &failed, &report_rows)?;
    tracing::info!(
        "... wrote {} rows to {}",
        report_rows.len().separate_with_commas(),
        paths.report.display()
    );

    let links = if args.check_for_ld && !hits.is_empty() {
        tracing::info!("Computing LD...");
        let before_ld = Instant::now();
        let links = compute_ld(args, &table, &hits)?;
        tracing::info!(
            "... found {} LD links in {:?}",
            links.len().separate_with_commas(),
            before_ld.elapsed()
        );
        let ld_rows = join_ld_report(&table, &hits, &links);
        if ld_rows.is_empty() {
            tracing::info!("no variants in LD found, no LD report written");
        } else {
            write_ld_report(&paths.ld_report, &table, &hits, &links, &ld_rows)?;
        }
        links
    } else {
        Vec::new()
    };

    tracing::info!("Writing top-level report...");
    let settings = TopLevelSettings {
        grouping: args.grouping_method,
        significance_threshold: args.sign_threshold,
        strict_r2: args.strict_group_r2,
        efo_traits: args.efo_codes.clone(),
    };
    let top_rows = build_top_level(&table, &hits, &report_rows, &links, &settings);
    tracing::info!(
        "... {} loci written to {}",
        top_rows.len().separate_with_commas(),
        paths.top_report.display()
    );
    write_top_level(&paths.top_report, top_rows, !args.efo_codes.is_empty())?;

    trace_rss_now();
    tracing::info!(
        "All of `compare` completed in {:?}",
        before_anything.elapsed()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use clap::Parser;
    use clap_verbosity_flag::Verbosity;
    use pretty_assertions::assert_eq;
    use temp_testdir::TempDir;

    use super::{run, Args, OutputPaths};
    use crate::{
        catalog::{custom::testing::write_indexed, Backend},
        common::Args as CommonArgs,
        compare::{top_level::GroupingMethod, CompareStyle},
        err::ArgError,
    };

    const INPUT: &str = "#chrom\tpos\tref\talt\tpval\tbeta\tmaf\tmaf_cases\tmaf_controls\t\
        #variant\tlocus_id\tpos_rmin\tpos_rmax\n\
        1\t100\tA\tG\t1e-9\t0.5\t0.1\t0.12\t0.09\tchr1_100_A_G\tchr1_100_A_G\t100\t200\n\
        1\t150\tC\tT\t1e-7\t0.4\t0.2\t0.22\t0.19\tchr1_150_C_T\tchr1_100_A_G\t100\t200\n\
        2\t500\tC\tT\t1e-8\t0.4\t0.2\t0.22\t0.19\tchr2_500_C_T\tchr2_500_C_T\t400\t600\n";

    const CUSTOM: &str = "1\t100\tG\tA\t1e-10\t0.1\t0.01\tT2D\t10.1/x\n\
        1\t150\tG\tA\t1e-9\t0.1\t0.01\tBMI\t10.1/y\n\
        1\t5000\tG\tA\t1e-9\t0.1\t0.01\tLDL\t10.1/z\n";

    fn common_args() -> CommonArgs {
        CommonArgs {
            verbose: Verbosity::new(0, 0),
        }
    }

    fn write_inputs(tmp_dir: &TempDir, input: &str) -> Result<(), anyhow::Error> {
        std::fs::write(tmp_dir.join("input.tsv"), input)?;
        write_indexed(&tmp_dir.join("custom.tsv.gz"), CUSTOM)?;
        Ok(())
    }

    fn file_args(tmp_dir: &TempDir) -> Args {
        let path = |name: &str| tmp_dir.join(name).display().to_string();
        Args::parse_from([
            "compare".to_string(),
            path("input.tsv"),
            "--compare-style".into(),
            "file".into(),
            "--custom-dataresource".into(),
            path("custom.tsv.gz"),
            "--report-out".into(),
            path("report_out.tsv"),
            "--ld-report-out".into(),
            path("ld_report_out.tsv"),
            "--top-report-out".into(),
            path("top_report.tsv"),
        ])
    }

    #[test]
    fn defaults() {
        let args = Args::parse_from(["compare", "input.tsv"]);

        assert_eq!(args.sign_threshold, 5e-8);
        assert_eq!(args.grouping_method, GroupingMethod::Simple);
        assert_eq!(args.compare_style, CompareStyle::Gwascatalog);
        assert_eq!(args.db, Backend::Gwas);
        assert_eq!(args.plink_memory, 12000);
        assert_eq!(args.gwascatalog_width_kb, 25);
        assert_eq!(args.gwascatalog_threads, 4);
        assert_eq!(args.ld_threshold, 0.9);
        assert_eq!(args.strict_group_r2, 0.5);
        assert_eq!(args.retry_attempts, 5);
        assert_eq!(args.retry_delay_ms, 500);
        assert_eq!(
            args.column_labels,
            vec!["#chrom", "pos", "ref", "alt", "pval", "beta", "maf", "maf_cases", "maf_controls"]
        );
        assert!(args.efo_codes.is_empty());
    }

    #[test]
    fn output_paths_prefixed() {
        let args = Args::parse_from(["compare", "input.tsv", "--prefix", "run1"]);

        let paths = OutputPaths::new(&args);

        assert_eq!(paths.report.display().to_string(), "run1.report_out.tsv");
        assert_eq!(paths.ld_report.display().to_string(), "run1.ld_report_out.tsv");
        assert_eq!(paths.top_report.display().to_string(), "run1.top_report.tsv");
        assert_eq!(paths.cache.display().to_string(), "run1.gwas_out_mapping.tsv");
    }

    #[test]
    fn missing_custom_resource() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        write_inputs(&tmp_dir, INPUT)?;
        let args = Args {
            custom_dataresource: None,
            ..file_args(&tmp_dir)
        };

        let err = run(&common_args(), &args).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArgError>(),
            Some(ArgError::MissingCustomResource(_))
        ));
        Ok(())
    }

    #[test]
    fn ld_requires_panel() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        write_inputs(&tmp_dir, INPUT)?;
        let args = Args {
            check_for_ld: true,
            ..file_args(&tmp_dir)
        };

        let err = run(&common_args(), &args).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ArgError>(),
            Some(ArgError::MissingLdPanel)
        ));
        Ok(())
    }

    #[test]
    fn empty_input_writes_nothing() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        write_inputs(
            &tmp_dir,
            "#chrom\tpos\tref\talt\tpval\tbeta\tmaf\tmaf_cases\tmaf_controls\n",
        )?;

        run(&common_args(), &file_args(&tmp_dir))?;

        assert!(!tmp_dir.join("report_out.tsv").exists());
        assert!(!tmp_dir.join("top_report.tsv").exists());
        Ok(())
    }

    #[test]
    fn smoke_test_custom_resource() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        write_inputs(&tmp_dir, INPUT)?;

        run(&common_args(), &file_args(&tmp_dir))?;

        let report = std::fs::read_to_string(tmp_dir.join("report_out.tsv"))?;
        let report = report.lines().collect::<Vec<_>>();
        assert_eq!(report.len(), 4);
        assert!(report[0].ends_with("\t#variant_hit\tpval_trait\ttrait\ttrait_name"));
        assert!(report[1].ends_with("\tchr1_100_G_A\t1e-10\tT2D\tT2D"), "{}", report[1]);
        assert!(report[2].ends_with("\tchr1_150_G_A\t1e-09\tBMI\tBMI"), "{}", report[2]);
        assert!(report[3].ends_with("\t400\t600\t\t\t\t"), "{}", report[3]);

        let top = std::fs::read_to_string(tmp_dir.join("top_report.tsv"))?;
        let top = top
            .lines()
            .map(|line| line.split('\t').collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(top.len(), 3);
        assert_eq!(
            top[1][..14],
            [
                "chr1_100_A_G",
                "1",
                "100",
                "150",
                "",
                "",
                "",
                "1e-09",
                "0.5",
                "0.1",
                "0.12",
                "0.09",
                "T2D|NA",
                "T2D|NA;BMI|NA",
            ]
        );
        assert_eq!(top[2][..4], ["chr2_500_C_T", "2", "500", "500"]);
        assert_eq!(top[2][12..14], ["", ""]);

        assert!(!tmp_dir.join("ld_report_out.tsv").exists());
        Ok(())
    }
}
