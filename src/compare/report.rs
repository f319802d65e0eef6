//! Joining of input variants with associations and writing of the report tables.

use std::{
    collections::HashMap,
    path::Path,
};

use crate::{
    catalog::Association,
    common::{build_chrom_map, cmp_chrom, fmt_num, io::open_write_maybe_gz},
    ld::LdLink,
    regions::Region,
    variants::VariantTable,
};

pub const COL_VARIANT_HIT: &str = "#variant_hit";
pub const COL_PVAL_TRAIT: &str = "pval_trait";
pub const COL_TRAIT: &str = "trait";
pub const COL_TRAIT_NAME: &str = "trait_name";
pub const COL_R2: &str = "r2";

/// Written into all hit columns if no source returned any association.
const NO_SOURCE_VALUE: &str = "NA";

/// Written into all hit columns of unmatched variants inside a failed query region.
const QUERY_FAILED_VALUE: &str = "FAILED";

/// One row of the report: an input variant and one of its associations, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRow {
    /// Index into the input table's rows.
    pub input: usize,
    /// Index into the associations.
    pub hit: Option<usize>,
}

/// One row of the LD report: a locus member, an association and their LD link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdReportRow {
    pub input: usize,
    pub link: usize,
    pub hit: usize,
}

/// Association indices by canonical variant identifier.
fn hits_by_canonical_id(hits: &[Association]) -> HashMap<String, Vec<usize>> {
    let mut result: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, hit) in hits.iter().enumerate() {
        result
            .entry(hit.variant().canonical_id())
            .or_default()
            .push(i);
    }
    result
}

/// Left-join the input variants with `hits` on the canonical variant identifier.
///
/// Rows are sorted by chromosome, position, alleles and identifier of the input variant.
pub fn join_report(table: &VariantTable, hits: &[Association]) -> Vec<ReportRow> {
    let by_id = hits_by_canonical_id(hits);
    let mut result = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        match by_id.get(&row.variant.canonical_id()) {
            Some(matching) => result.extend(matching.iter().map(|&hit| ReportRow {
                input: i,
                hit: Some(hit),
            })),
            None => result.push(ReportRow {
                input: i,
                hit: None,
            }),
        }
    }

    let chrom_map = build_chrom_map();
    result.sort_by(|a, b| {
        let (lhs, rhs) = (&table.rows[a.input], &table.rows[b.input]);
        cmp_chrom(&chrom_map, &lhs.variant.chrom, &rhs.variant.chrom)
            .then_with(|| lhs.variant.pos.cmp(&rhs.variant.pos))
            .then_with(|| lhs.variant.ref_allele.cmp(&rhs.variant.ref_allele))
            .then_with(|| lhs.variant.alt_allele.cmp(&rhs.variant.alt_allele))
            .then_with(|| lhs.id.cmp(&rhs.id))
    });
    result
}

/// Join LD links onto the locus member rows and the associations of the linked variants.
pub fn join_ld_report(
    table: &VariantTable,
    hits: &[Association],
    links: &[LdLink],
) -> Vec<LdReportRow> {
    let by_id = hits_by_canonical_id(hits);
    let mut links_by_member: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, link) in links.iter().enumerate() {
        links_by_member
            .entry(link.member_id.as_str())
            .or_default()
            .push(i);
    }

    let mut result = Vec::new();
    for (input, row) in table.rows.iter().enumerate() {
        let Some(member_links) = links_by_member.get(row.id.as_str()) else {
            continue;
        };
        for &link in member_links {
            if let Some(matching) = by_id.get(&links[link].hit_canonical_id) {
                result.extend(
                    matching
                        .iter()
                        .map(|&hit| LdReportRow { input, link, hit }),
                );
            }
        }
    }
    result
}

fn open_tsv_writer(path: &Path) -> Result<csv::Writer<Box<dyn std::io::Write>>, anyhow::Error> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(open_write_maybe_gz(path).map_err(|e| {
            anyhow::anyhow!("Cannot open {:?} for writing: {:?}", path, e)
        })?))
}

/// Write the report: all input columns followed by the hit columns.
///
/// Unmatched variants inside one of the `failed` query regions are marked as such.
pub fn write_report(
    path: &Path,
    table: &VariantTable,
    hits: &[Association],
    failed: &[Region],
    rows: &[ReportRow],
) -> Result<(), anyhow::Error> {
    let mut writer = open_tsv_writer(path)?;
    let mut header = table.header.clone();
    header.extend(
        [COL_VARIANT_HIT, COL_PVAL_TRAIT, COL_TRAIT, COL_TRAIT_NAME].map(str::to_string),
    );
    writer.write_record(&header)?;

    for row in rows {
        let input = &table.rows[row.input];
        let mut record = input.fields.clone();
        let in_failed = || {
            failed
                .iter()
                .any(|region| region.contains(&input.variant.chrom, input.variant.pos))
        };
        let fill = |value: &str| std::iter::repeat(value.to_string()).take(4);
        match row.hit.map(|i| &hits[i]) {
            Some(hit) => record.extend([
                hit.variant().id(),
                fmt_num(hit.pval),
                hit.trait_code.clone(),
                hit.trait_name.clone().unwrap_or_default(),
            ]),
            None if in_failed() => record.extend(fill(QUERY_FAILED_VALUE)),
            None if hits.is_empty() => record.extend(fill(NO_SOURCE_VALUE)),
            None => record.extend(fill("")),
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the LD report: input columns of the locus member followed by the linked association.
pub fn write_ld_report(
    path: &Path,
    table: &VariantTable,
    hits: &[Association],
    links: &[LdLink],
    rows: &[LdReportRow],
) -> Result<(), anyhow::Error> {
    let mut writer = open_tsv_writer(path)?;
    let mut header = table.header.clone();
    header.extend([COL_VARIANT_HIT, COL_R2, COL_TRAIT, COL_TRAIT_NAME].map(str::to_string));
    writer.write_record(&header)?;

    for row in rows {
        let (link, hit) = (&links[row.link], &hits[row.hit]);
        let mut record = table.rows[row.input].fields.clone();
        record.extend([
            link.hit_id.clone(),
            fmt_num(link.r2),
            hit.trait_code.clone(),
            hit.trait_name.clone().unwrap_or_default(),
        ]);
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{join_ld_report, join_report, write_ld_report, write_report, LdReportRow, ReportRow};
    use crate::{
        catalog::{test::assoc, Association},
        ld::LdLink,
        regions::Region,
        variants::test::table_from_str,
    };

    const INPUT: &str = "#chrom\tpos\tref\talt\tpval\t#variant\tlocus_id\n\
        2\t50\tC\tT\t1e-9\tchr2_50_C_T\tchr2_50_C_T\n\
        X\t10\tA\tC\t1e-9\tchrX_10_A_C\tchrX_10_A_C\n\
        1\t100\tA\tG\t1e-10\tchr1_100_A_G\tchr1_100_A_G\n\
        1\t150\tC\tT\t1e-6\tchr1_150_C_T\tchr1_100_A_G\n";

    fn named(mut hit: Association, name: &str) -> Association {
        hit.trait_name = Some(name.to_string());
        hit
    }

    #[test]
    fn join_sorted_left_join() {
        let table = table_from_str(INPUT);
        let hits = vec![
            named(assoc("1", 100, "G", "A", 2e-9, "EFO_1"), "height"),
            named(assoc("1", 100, "A", "G", 3e-9, "EFO_2"), "weight"),
            named(assoc("1", 150, "G", "A", 3e-9, "EFO_3"), "BMI"),
        ];

        let rows = join_report(&table, &hits);

        assert_eq!(
            rows,
            vec![
                ReportRow { input: 2, hit: Some(0) },
                ReportRow { input: 2, hit: Some(1) },
                ReportRow { input: 3, hit: Some(2) },
                ReportRow { input: 0, hit: None },
                ReportRow { input: 1, hit: None },
            ]
        );
    }

    #[test]
    fn write_with_hits() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("report_out.tsv");
        let table = table_from_str(INPUT);
        let hits = vec![named(assoc("1", 100, "G", "A", 2.1234e-9, "EFO_1"), "height")];

        write_report(&path, &table, &hits, &[], &join_report(&table, &hits))?;

        let lines = std::fs::read_to_string(&path)?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "#chrom\tpos\tref\talt\tpval\t#variant\tlocus_id\t#variant_hit\tpval_trait\ttrait\ttrait_name"
        );
        assert_eq!(
            lines[1],
            "1\t100\tA\tG\t1e-10\tchr1_100_A_G\tchr1_100_A_G\tchr1_100_G_A\t2.12e-09\tEFO_1\theight"
        );
        assert_eq!(
            lines[2],
            "1\t150\tC\tT\t1e-6\tchr1_150_C_T\tchr1_100_A_G\t\t\t\t"
        );
        assert_eq!(lines.len(), 5);
        Ok(())
    }

    #[test]
    fn write_without_sources() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("report_out.tsv");
        let table = table_from_str(INPUT);

        write_report(&path, &table, &[], &[], &join_report(&table, &[]))?;

        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents.lines().count(), 5);
        assert!(contents.lines().skip(1).all(|l| l.ends_with("\tNA\tNA\tNA\tNA")));
        Ok(())
    }

    #[test]
    fn write_with_failed_regions() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("report_out.tsv");
        let table = table_from_str(INPUT);
        let hits = vec![named(assoc("1", 100, "G", "A", 2e-9, "EFO_1"), "height")];
        let failed = vec![
            Region::new("1", 0, 25_150)?,
            Region::new("23", 0, 25_010)?,
        ];

        write_report(&path, &table, &hits, &failed, &join_report(&table, &hits))?;

        let lines = std::fs::read_to_string(&path)?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].ends_with("\tchr1_100_G_A\t2e-09\tEFO_1\theight"), "{}", lines[1]);
        assert!(lines[2].ends_with("\tFAILED\tFAILED\tFAILED\tFAILED"), "{}", lines[2]);
        assert!(lines[3].starts_with("2\t50\t"), "{}", lines[3]);
        assert!(lines[3].ends_with("\tchr2_50_C_T\t\t\t\t"), "{}", lines[3]);
        assert!(lines[4].ends_with("\tFAILED\tFAILED\tFAILED\tFAILED"), "{}", lines[4]);
        Ok(())
    }

    #[test]
    fn write_all_failed_is_not_na() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("report_out.tsv");
        let table = table_from_str(INPUT);
        let failed = vec![Region::new("2", 0, 100)?];

        write_report(&path, &table, &[], &failed, &join_report(&table, &[]))?;

        let contents = std::fs::read_to_string(&path)?;
        let lines = contents.lines().collect::<Vec<_>>();
        assert!(lines[3].starts_with("2\t50\t"), "{}", lines[3]);
        assert!(lines[3].ends_with("\tFAILED\tFAILED\tFAILED\tFAILED"));
        assert!(lines[1].ends_with("\tNA\tNA\tNA\tNA"));
        Ok(())
    }

    #[test]
    fn ld_report() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("ld_report_out.tsv");
        let table = table_from_str(INPUT);
        let hits = vec![
            named(assoc("1", 120, "G", "T", 1e-12, "EFO_7"), "LDL"),
            named(assoc("1", 130, "G", "T", 1e-12, "EFO_8"), "HDL"),
        ];
        let links = vec![LdLink {
            locus_id: "chr1_100_A_G".into(),
            member_id: "chr1_150_C_T".into(),
            hit_id: "chr1_120_T_G".into(),
            hit_canonical_id: "chr1_120_A_C".into(),
            r2: 0.9409,
        }];

        let rows = join_ld_report(&table, &hits, &links);
        assert_eq!(rows, vec![LdReportRow { input: 3, link: 0, hit: 0 }]);

        write_ld_report(&path, &table, &hits, &links, &rows)?;

        let lines = std::fs::read_to_string(&path)?
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "#chrom\tpos\tref\talt\tpval\t#variant\tlocus_id\t#variant_hit\tr2\ttrait\ttrait_name",
                "1\t150\tC\tT\t1e-6\tchr1_150_C_T\tchr1_100_A_G\tchr1_120_T_G\t0.941\tEFO_7\tLDL",
            ]
        );
        Ok(())
    }
}
