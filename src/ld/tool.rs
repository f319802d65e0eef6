//! Invocation of the external `plink` and `ldstore` tools and their scratch directories.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::TempDir;

use crate::common::io::require_file;

/// Exit status and combined output of a tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub output: String,
}

/// Runs external programs.
pub trait ToolRunner {
    /// Run `program` with `args` to completion.
    ///
    /// # Errors
    ///
    /// Only if the program could not be started; a non-zero exit is reported in the output.
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput, anyhow::Error>;
}

/// `ToolRunner` that spawns processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput, anyhow::Error> {
        tracing::debug!("running {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| {
            anyhow::anyhow!(
                "could not run {}: {} (is it installed and on the PATH?)",
                program,
                e
            )
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: text,
        })
    }
}

/// Configuration of the LD computation.
#[derive(Debug, Clone, PartialEq, derive_builder::Builder)]
pub struct LdConfig {
    #[builder(setter(into), default = "\"plink\".to_string()")]
    pub plink_bin: String,
    #[builder(setter(into), default = "\"ldstore\".to_string()")]
    pub ldstore_bin: String,
    /// PLINK binary fileset prefix, i.e., path without `.bed`.
    #[builder(setter(into))]
    pub panel: PathBuf,
    /// Memory for `plink` in MB.
    #[builder(default = "12000")]
    pub plink_memory_mb: usize,
    /// Upper bound on `ldstore` threads.
    #[builder(default = "4")]
    pub max_threads: usize,
    /// r^2 threshold; `ldstore` receives its square root.
    #[builder(default = "0.9")]
    pub ld_threshold: f64,
    /// Directory to create scratch directories in.
    #[builder(setter(into), default = "std::env::temp_dir()")]
    pub scratch_dir: PathBuf,
    /// Prefix for scratch directory names; concurrent runs need distinct prefixes.
    #[builder(setter(into), default)]
    pub prefix: String,
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn log_failure(what: &str, output: &ToolOutput) {
    tracing::warn!(
        "{} failed with exit code {:?}, skipping",
        what,
        output.code
    );
    for line in output.output.lines() {
        tracing::debug!("  | {}", line);
    }
}

/// Genotype subset of one chromosome, removed when dropped.
pub struct ChromosomeBatch {
    chrom: String,
    dir: TempDir,
}

impl ChromosomeBatch {
    /// Extract `chrom` from the panel with `plink`.
    ///
    /// Returns `Ok(None)` if `plink` exits with failure.
    ///
    /// # Errors
    ///
    /// If `plink` cannot be run or succeeds without writing the `.bed` file.
    pub fn extract<R: ToolRunner>(
        config: &LdConfig,
        runner: &R,
        chrom: &str,
    ) -> Result<Option<Self>, anyhow::Error> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}ld_chr{}_", &config.prefix, chrom))
            .tempdir_in(&config.scratch_dir)
            .map_err(|e| {
                anyhow::anyhow!(
                    "could not create scratch directory in {}: {}",
                    config.scratch_dir.display(),
                    e
                )
            })?;
        let batch = Self {
            chrom: chrom.to_string(),
            dir,
        };

        let args = vec![
            "--bfile".to_string(),
            path_arg(&config.panel),
            "--output-chr".to_string(),
            "M".to_string(),
            "--chr".to_string(),
            chrom.to_string(),
            "--make-bed".to_string(),
            "--out".to_string(),
            path_arg(&batch.genotypes()),
            "--memory".to_string(),
            config.plink_memory_mb.to_string(),
        ];
        let output = runner.run(&config.plink_bin, &args)?;
        if !output.success {
            log_failure(&format!("plink for chromosome {}", chrom), &output);
            return Ok(None);
        }
        let bed = PathBuf::from(format!("{}.bed", path_arg(&batch.genotypes())));
        require_file(
            &bed,
            "plink did not write the chromosome subset; check the LD panel path",
        )?;
        Ok(Some(batch))
    }

    pub fn chrom(&self) -> &str {
        &self.chrom
    }

    /// Prefix of the extracted PLINK fileset.
    pub fn genotypes(&self) -> PathBuf {
        self.dir.path().join("temp_chrom")
    }

    /// Create the scratch directory for one locus.
    pub fn locus_scratch(&self) -> Result<LocusScratch, anyhow::Error> {
        let dir = tempfile::Builder::new()
            .prefix("locus_")
            .tempdir_in(self.dir.path())
            .map_err(|e| anyhow::anyhow!("could not create locus scratch directory: {}", e))?;
        Ok(LocusScratch { dir })
    }
}

/// Files of one locus computation, removed when dropped.
pub struct LocusScratch {
    dir: TempDir,
}

impl LocusScratch {
    pub fn bcor(&self) -> PathBuf {
        self.dir.path().join("temp_corr.bcor")
    }

    pub fn variant_list(&self) -> PathBuf {
        self.dir.path().join("var_lst")
    }

    pub fn table(&self) -> PathBuf {
        self.dir.path().join("ld_table.table")
    }
}

/// The `ldstore` calls of one locus.
pub struct Ldstore<'a, R: ToolRunner> {
    pub config: &'a LdConfig,
    pub runner: &'a R,
}

impl<'a, R: ToolRunner> Ldstore<'a, R> {
    fn call(&self, what: &str, args: Vec<String>) -> Result<bool, anyhow::Error> {
        let output = self.runner.run(&self.config.ldstore_bin, &args)?;
        if !output.success {
            log_failure(what, &output);
        }
        Ok(output.success)
    }

    /// Build the correlation matrix of `[rmin, rmax]` and merge its chunks.
    ///
    /// Returns `false` if a call failed.
    pub fn correlate(
        &self,
        batch: &ChromosomeBatch,
        scratch: &LocusScratch,
        rmin: i64,
        rmax: i64,
        threads: usize,
        locus_id: &str,
    ) -> Result<bool, anyhow::Error> {
        let what = format!("ldstore for locus {}", locus_id);
        let build = vec![
            "--bplink".to_string(),
            path_arg(&batch.genotypes()),
            "--bcor".to_string(),
            path_arg(&scratch.bcor()),
            "--ld-thold".to_string(),
            self.config.ld_threshold.sqrt().to_string(),
            "--incl-range".to_string(),
            format!("{}-{}", rmin, rmax),
            "--n-threads".to_string(),
            threads.to_string(),
        ];
        if !self.call(&what, build)? {
            return Ok(false);
        }
        let merge = vec![
            "--bcor".to_string(),
            path_arg(&scratch.bcor()),
            "--merge".to_string(),
            threads.to_string(),
        ];
        if !self.call(&what, merge)? {
            return Ok(false);
        }
        require_file(&scratch.bcor(), &chrom_naming_hint("LD correlation file"))?;
        Ok(true)
    }

    /// Write the pairwise table of the variants in the scratch variant list.
    ///
    /// Returns `false` if the call failed.
    pub fn table(&self, scratch: &LocusScratch, locus_id: &str) -> Result<bool, anyhow::Error> {
        let args = vec![
            "--bcor".to_string(),
            path_arg(&scratch.bcor()),
            "--table".to_string(),
            path_arg(&scratch.table()),
            "--incl-variants".to_string(),
            path_arg(&scratch.variant_list()),
        ];
        if !self.call(&format!("ldstore for locus {}", locus_id), args)? {
            return Ok(false);
        }
        require_file(&scratch.table(), &chrom_naming_hint("LD table"))?;
        Ok(true)
    }
}

fn chrom_naming_hint(what: &str) -> String {
    format!(
        "{} was not written; check that chromosome names agree between input and LD panel, \
        e.g. 23 in both instead of 23 and X",
        what
    )
}


#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{testing::FakeRunner, ChromosomeBatch, LdConfig, LdConfigBuilder};
    use crate::err::AppError;

    fn config(scratch_dir: &std::path::Path) -> LdConfig {
        LdConfigBuilder::default()
            .panel("/data/panel")
            .scratch_dir(scratch_dir)
            .prefix("run1.")
            .build()
            .unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = LdConfigBuilder::default().panel("/p").build().unwrap();
        assert_eq!(config.plink_bin, "plink");
        assert_eq!(config.ldstore_bin, "ldstore");
        assert_eq!(config.plink_memory_mb, 12000);
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.ld_threshold, 0.9);
        assert_eq!(config.prefix, "");
    }

    #[test]
    fn extract_chromosome() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let config = config(&tmp_dir);
        let runner = FakeRunner::new(|_| String::new());

        let batch = ChromosomeBatch::extract(&config, &runner, "7")?.expect("plink succeeded");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "plink");
        assert_eq!(
            calls[0].1[..8].to_vec(),
            vec!["--bfile", "/data/panel", "--output-chr", "M", "--chr", "7", "--make-bed", "--out"]
        );
        assert_eq!(calls[0].1[9..].to_vec(), vec!["--memory", "12000"]);
        assert_eq!(batch.chrom(), "7");
        let dir_name = batch
            .genotypes()
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        assert!(dir_name.starts_with("run1.ld_chr7_"), "{}", dir_name);

        drop(batch);
        assert_eq!(std::fs::read_dir(&*tmp_dir)?.count(), 0);
        Ok(())
    }

    #[test]
    fn extract_failure_is_skipped() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut runner = FakeRunner::new(|_| String::new());
        runner.fail_on = Some("--make-bed".to_string());

        let batch = ChromosomeBatch::extract(&config(&tmp_dir), &runner, "7")?;

        assert!(batch.is_none());
        assert_eq!(std::fs::read_dir(&*tmp_dir)?.count(), 0);
        Ok(())
    }

    #[test]
    fn extract_missing_output_is_fatal() {
        let tmp_dir = temp_testdir::TempDir::default();
        let mut runner = FakeRunner::new(|_| String::new());
        runner.skip_outputs = true;

        let err = ChromosomeBatch::extract(&config(&tmp_dir), &runner, "7")
            .err()
            .expect("missing .bed must fail");

        assert!(matches!(
            err.downcast_ref::<AppError>(),
            Some(AppError::MissingResource { .. })
        ));
        assert!(err.to_string().contains("temp_chrom.bed"));
    }
}
