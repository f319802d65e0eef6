//! Backend serving associations from a custom, bgzipped and indexed TSV file.
//!
//! The file has the columns `chrom pos ref alt pval beta se trait study_doi`; an optional
//! header line is skipped.  Each region is answered with a tabix or CSI index query.

use std::{
    fs::File,
    io::{self, BufRead},
    path::{Path, PathBuf},
};

use noodles_bgzf as bgzf;
use noodles_core::{region::Interval, Position};
use noodles_csi::{self as csi, binning_index::index::reference_sequence::bin::Chunk, BinningIndex};
use noodles_tabix as tabix;

use super::{Association, AssociationSource, Error};
use crate::{
    common::io::{require_file, Source},
    err::AppError,
    regions::Region,
    variants::{alleles::is_valid_allele, parse_position, present, Variant},
};

/// Custom rows carry no harmonization code.
const NO_CODE: i32 = 0;

/// Return the path of the tabix or CSI index next to `path`.
///
/// # Errors
///
/// `AppError::MissingResource` naming the expected `.tbi` path if neither index exists.
pub fn find_index(path: &Path) -> Result<PathBuf, AppError> {
    let with_suffix = |suffix: &str| PathBuf::from(format!("{}{}", path.display(), suffix));
    let tbi = with_suffix(".tbi");
    let csi = with_suffix(".csi");
    if tbi.exists() {
        Ok(tbi)
    } else if csi.exists() {
        Ok(csi)
    } else {
        Err(AppError::MissingResource {
            path: tbi,
            hint: format!(
                "custom resource {} needs a tabix (.tbi) or CSI (.csi) index",
                path.display()
            ),
        })
    }
}

/// Index of the custom resource.
enum CustomIndex {
    Tabix(tabix::Index),
    Csi(csi::Index),
}

impl CustomIndex {
    fn read(path: &Path) -> io::Result<Self> {
        if path.extension().map(|ext| ext == "csi").unwrap_or(false) {
            csi::read(path).map(CustomIndex::Csi)
        } else {
            tabix::read(path).map(CustomIndex::Tabix)
        }
    }

    /// Chunks of the bgzipped file overlapping `region`; empty for unknown chromosomes.
    fn chunks(&self, region: &Region) -> io::Result<Vec<Chunk>> {
        match self {
            CustomIndex::Tabix(index) => query_chunks(index, region),
            CustomIndex::Csi(index) => query_chunks(index, region),
        }
    }
}

fn query_chunks<I: BinningIndex>(index: &I, region: &Region) -> io::Result<Vec<Chunk>> {
    let Some(reference_sequence_id) = index.header().and_then(|header| {
        header.reference_sequence_names().iter().position(|name| {
            let name: &[u8] = name.as_ref();
            name == region.chrom().as_bytes()
        })
    }) else {
        return Ok(Vec::new());
    };

    let to_position = |pos: i64| {
        Position::try_from(usize::try_from(pos.max(1)).unwrap_or(1))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    let interval = Interval::from(to_position(region.start())?..=to_position(region.end())?);
    index.query(reference_sequence_id, interval)
}

/// Custom association resource, queried through its index.
pub struct CustomSource {
    path: PathBuf,
    index: CustomIndex,
}

impl CustomSource {
    /// Open `source`, requiring the file and its index to exist.
    pub fn from_source(source: &Source) -> Result<Self, anyhow::Error> {
        let path = source
            .path()
            .ok_or_else(|| anyhow::anyhow!("no custom resource path given"))?;
        require_file(path, "custom resource not found: does the file exist?")?;
        let index_path = find_index(path)?;
        let index = CustomIndex::read(&index_path).map_err(|e| {
            anyhow::anyhow!("could not read index {}: {}", index_path.display(), e)
        })?;
        tracing::debug!(
            "opened custom resource {} with index {}",
            path.display(),
            index_path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            index,
        })
    }

    /// Read the rows of `chunks` that fall into `region`.
    fn read_region(&self, region: &Region, chunks: &[Chunk]) -> Result<Vec<Association>, Error> {
        let mut reader = File::open(&self.path).map(bgzf::Reader::new)?;
        let mut result = Vec::new();
        let mut line = String::new();
        for chunk in chunks {
            reader.seek(chunk.start())?;
            while reader.virtual_position() < chunk.end() {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    break;
                }
                let line = line.trim_end_matches(['\n', '\r']);
                if line.starts_with('#') {
                    continue;
                }
                let record = csv::StringRecord::from(line.split('\t').collect::<Vec<_>>());
                match parse_row(&record) {
                    Some(association) if region.contains(&association.chrom, association.pos) => {
                        result.push(association)
                    }
                    Some(_) => (),
                    None => tracing::trace!("skipping malformed custom row {:?}", line),
                }
            }
        }
        Ok(result)
    }
}

fn parse_row(record: &csv::StringRecord) -> Option<Association> {
    let field = |i: usize| record.get(i).map(str::trim);
    let optional = |i: usize| field(i).and_then(present);

    let variant = Variant::new(
        field(0)?,
        parse_position(field(1)?)?,
        field(2)?,
        field(3)?,
    );
    let trait_code = field(7)?.to_string();
    let mut association = Association::new(variant, field(4)?.parse().ok()?, trait_code.clone(), NO_CODE);
    association.beta = optional(5).and_then(|v| v.parse().ok());
    association.se = optional(6).and_then(|v| v.parse().ok());
    association.study_doi = optional(8).map(str::to_string);
    association.trait_name = Some(trait_code);
    Some(association)
}

#[async_trait::async_trait]
impl AssociationSource for CustomSource {
    fn name(&self) -> &str {
        "custom resource"
    }

    async fn fetch(&self, region: &Region, pval: f64) -> Result<Vec<Association>, Error> {
        let chunks = self.index.chunks(region)?;
        tracing::trace!("{}: {} index chunks", region, chunks.len());
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .read_region(region, &chunks)?
            .into_iter()
            .filter(|a| a.pval <= pval)
            .filter(|a| {
                is_valid_allele(&a.ref_allele.to_ascii_uppercase())
                    && is_valid_allele(&a.alt_allele.to_ascii_uppercase())
            })
            .collect())
    }

    async fn resolve_trait(&self, code: &str) -> String {
        code.to_string()
    }
}

#[cfg(test)]
pub mod testing {
    use std::{io::Write, path::Path};

    use noodles_bgzf as bgzf;
    use noodles_core::Position;
    use noodles_csi::{self as csi, binning_index::index::reference_sequence::bin::Chunk};
    use noodles_tabix as tabix;

    /// Write `data` bgzipped to `path` and its tabix index to `{path}.tbi`.
    ///
    /// Lines without an integer in the second column are written but not indexed.
    pub fn write_indexed(path: &Path, data: &str) -> Result<(), anyhow::Error> {
        let mut writer = std::fs::File::create(path).map(bgzf::Writer::new)?;
        let mut indexer = tabix::index::Indexer::default();
        indexer.set_header(csi::binning_index::index::header::Builder::vcf().build());

        for line in data.lines() {
            let start_position = writer.virtual_position();
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            // one block per record
            writer.flush()?;
            let end_position = writer.virtual_position();

            let fields = line.split('\t').collect::<Vec<_>>();
            let Some(pos) = fields.get(1).and_then(|pos| pos.parse::<usize>().ok()) else {
                continue;
            };
            let pos = Position::try_from(pos)
                .map_err(|e| anyhow::anyhow!("invalid position {}: {}", pos, e))?;
            indexer.add_record(fields[0], pos, pos, Chunk::new(start_position, end_position))?;
        }
        writer.finish()?;

        let index = indexer.build();
        let mut index_writer = std::fs::File::create(format!("{}.tbi", path.display()))
            .map(tabix::Writer::new)?;
        index_writer.write_index(&index)?;
        Ok(())
    }
}
