use std::io::{self, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::aggregate::ReviewTable;
use crate::app::{AggregateResult, RunResult, StatusResult, StrainFetch, StrainsResult};
use crate::error::HarvestError;
use crate::metadata::StrainTable;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_strains(result: &StrainsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &StrainFetch) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_aggregate(result: &AggregateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}

pub struct CsvExport;

impl CsvExport {
    pub fn write_strains(path: &Utf8Path, table: &StrainTable) -> Result<usize, HarvestError> {
        Self::write_rows(path, table.rows())
    }

    pub fn write_reviews(path: &Utf8Path, table: &ReviewTable) -> Result<usize, HarvestError> {
        Self::write_rows(path, table.rows())
    }

    fn write_rows<T: Serialize>(path: &Utf8Path, rows: &[T]) -> Result<usize, HarvestError> {
        let csv_error = |err: csv::Error| HarvestError::Filesystem(format!("{path}: {err}"));
        let mut writer = csv::Writer::from_path(path.as_std_path()).map_err(csv_error)?;
        for row in rows {
            writer.serialize(row).map_err(csv_error)?;
        }
        writer
            .flush()
            .map_err(|err| HarvestError::Filesystem(format!("{path}: {err}")))?;
        Ok(rows.len())
    }
}
