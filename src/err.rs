use std::path::PathBuf;

/// Errors that abort a run.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("required resource {} does not exist: {hint}", path.display())]
    MissingResource { path: PathBuf, hint: String },
    #[error("invalid region {chrom}:{start}-{end}: start is larger than end")]
    InvalidRegion { chrom: String, start: i64, end: i64 },
    #[error("input table {path} is missing required columns: {}", missing.join(", "))]
    MissingColumns { path: String, missing: Vec<String> },
    #[error("expected {expected} column labels but got {actual}")]
    InvalidColumnLabels { expected: usize, actual: usize },
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ArgError {
    #[error("LD computation requires locus grouping (columns locus_id, pos_rmin, pos_rmax)")]
    LdWithoutGrouping,
    #[error("compare style {0} requires a custom resource path")]
    MissingCustomResource(String),
    #[error("the local catalog backend requires --local-gwascatalog")]
    MissingLocalCatalog,
    #[error("LD computation requires --ld-panel-path")]
    MissingLdPanel,
}
