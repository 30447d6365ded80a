// MPower - Device power and thermal modeling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tabular I/O
//!
//! Reads the model input table (one row per sample) into a [`Dataset`] and
//! writes result tables. Unparseable or empty numeric cells become missing
//! values; the fill policy is applied later by [`crate::sample::RunSignals`].

use crate::error::{MpowerError, Result};
use crate::sample::{Dataset, Sample};
use log::debug;
use serde::Serialize;
use std::io;
use std::path::Path;

/// Columns of the model input table, in write order.
pub const INPUT_COLUMNS: [&str; 13] = [
    "run_name",
    "scenario",
    "t_s",
    "dt_s",
    "soc_pct",
    "voltage_mV",
    "temperature_C",
    "temperature_cpu_C",
    "power_total_mW",
    "power_cpu_mW",
    "power_screen_mW",
    "is_gps_on",
    "cellular_on",
];

/// Column positions resolved from the header row.
struct ColumnMap {
    idx: [Option<usize>; 13],
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let mut idx = [None; 13];
        for (slot, name) in idx.iter_mut().zip(INPUT_COLUMNS.iter()) {
            *slot = headers.iter().position(|h| h.trim() == *name);
        }
        for required in ["run_name", "t_s"] {
            if Self::slot(required).and_then(|s| idx[s]).is_none() {
                return Err(MpowerError::MissingColumn(required.to_string()));
            }
        }
        for (name, slot) in INPUT_COLUMNS.iter().zip(idx.iter()) {
            if slot.is_none() {
                debug!("input table has no '{}' column; treating as missing", name);
            }
        }
        Ok(Self { idx })
    }

    fn slot(name: &str) -> Option<usize> {
        INPUT_COLUMNS.iter().position(|c| *c == name)
    }

    fn text<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        let i = Self::slot(name).and_then(|s| self.idx[s])?;
        record.get(i).map(str::trim).filter(|s| !s.is_empty())
    }

    fn number(&self, record: &csv::StringRecord, name: &str) -> Option<f64> {
        self.text(record, name)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }

    fn flag(&self, record: &csv::StringRecord, name: &str) -> Option<bool> {
        let s = self.text(record, name)?;
        match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" => Some(true),
            "false" | "no" | "off" => Some(false),
            other => other.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v >= 0.5),
        }
    }
}

/// Read the model input table from a file.
pub fn read_dataset(path: impl AsRef<Path>) -> Result<Dataset> {
    let reader = csv::Reader::from_path(path)?;
    read_dataset_from(reader)
}

/// Read the model input table from any CSV reader.
pub fn read_dataset_from<R: io::Read>(mut reader: csv::Reader<R>) -> Result<Dataset> {
    let headers = reader.headers()?.clone();
    let columns = ColumnMap::from_headers(&headers)?;

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        // Header is line 1.
        let line = i + 2;
        let run_name = columns
            .text(&record, "run_name")
            .ok_or_else(|| MpowerError::InvalidRow {
                line,
                reason: "empty run_name".to_string(),
            })?
            .to_string();
        let t_s = columns
            .number(&record, "t_s")
            .ok_or_else(|| MpowerError::InvalidRow {
                line,
                reason: "unparseable t_s".to_string(),
            })?;
        let scenario = columns.text(&record, "scenario").unwrap_or("").to_string();

        let sample = Sample {
            t_s,
            dt_s: columns.number(&record, "dt_s").unwrap_or(0.0),
            soc_pct: columns.number(&record, "soc_pct"),
            voltage_mv: columns.number(&record, "voltage_mV"),
            temperature_c: columns.number(&record, "temperature_C"),
            temperature_cpu_c: columns.number(&record, "temperature_cpu_C"),
            power_total_mw: columns.number(&record, "power_total_mW"),
            power_cpu_mw: columns.number(&record, "power_cpu_mW"),
            power_screen_mw: columns.number(&record, "power_screen_mW"),
            is_gps_on: columns.flag(&record, "is_gps_on"),
            cellular_on: columns.flag(&record, "cellular_on"),
        };
        rows.push((run_name, scenario, sample));
    }

    let dataset = Dataset::from_rows(rows);
    debug!(
        "loaded {} samples in {} runs",
        dataset.sample_count(),
        dataset.len()
    );
    Ok(dataset)
}

fn opt(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

fn opt_flag(v: Option<bool>) -> String {
    v.map(|b| if b { "1" } else { "0" }.to_string()).unwrap_or_default()
}

/// Write a dataset in the model input format.
pub fn write_dataset(path: impl AsRef<Path>, dataset: &Dataset) -> Result<()> {
    let writer = csv::Writer::from_path(path)?;
    write_dataset_to(writer, dataset)
}

pub fn write_dataset_to<W: io::Write>(mut writer: csv::Writer<W>, dataset: &Dataset) -> Result<()> {
    writer.write_record(INPUT_COLUMNS)?;
    for run in dataset.runs() {
        for s in run.samples() {
            writer.write_record([
                run.name().to_string(),
                run.scenario().to_string(),
                s.t_s.to_string(),
                s.dt_s.to_string(),
                opt(s.soc_pct),
                opt(s.voltage_mv),
                opt(s.temperature_c),
                opt(s.temperature_cpu_c),
                opt(s.power_total_mw),
                opt(s.power_cpu_mw),
                opt(s.power_screen_mw),
                opt_flag(s.is_gps_on),
                opt_flag(s.cellular_on),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write flat serializable rows with a header derived from field names.
pub fn write_rows<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a table with an explicit header.
pub fn write_table(path: impl AsRef<Path>, header: &[String], rows: &[Vec<String>]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
