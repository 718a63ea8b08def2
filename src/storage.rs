//! Measurement file output.
//!
//! Each run writes up to three files sharing a stem:
//! - `<stem>.txt`: a `#` header line, then delimited `x y` rows
//! - `<stem>_params.txt`: parameter readback (name, query, reply)
//! - `<stem>.json`: the full [`TraceDataset`] (or list of them) as JSON
//!
//! Displays that share one x axis are written side by side as `x y0 y1`
//! columns. Displays with different x axes are written one after the other,
//! each under its own `# display N` line.
//!
//! Overflow/underflow markers are written as the words `overflow` and
//! `underflow`, never as numbers.

use chrono::{DateTime, Utc};
use daq_core::data::TraceDataset;
use daq_core::error::{AppResult, DaqError};
use daq_driver_sr785::ParameterReading;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// File stem for a run: `<name>_<YYYYmmdd_HHMMSS>`.
pub fn file_stem(name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", name, at.format("%Y%m%d_%H%M%S"))
}

fn delimiter_byte(delimiter: char) -> AppResult<u8> {
    if delimiter.is_ascii() {
        Ok(delimiter as u8)
    } else {
        Err(DaqError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("delimiter {delimiter:?} is not ASCII"),
        )))
    }
}

fn create(dir: &Path, name: String) -> AppResult<(PathBuf, BufWriter<File>)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let file = File::create(&path)?;
    Ok((path, BufWriter::new(file)))
}

fn write_rows<W, I>(out: W, delimiter: u8, rows: I) -> AppResult<()>
where
    W: Write,
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(out);
    for row in rows {
        writer.write_record(&row).map_err(std::io::Error::from)?;
    }
    writer.flush()?;
    Ok(())
}

fn point_rows(dataset: &TraceDataset) -> impl Iterator<Item = Vec<String>> + '_ {
    dataset
        .points
        .iter()
        .map(|point| vec![point.x.to_string(), point.y.to_string()])
}

/// Write the delimited data file for a single display. Returns its path.
pub fn write_dataset(
    dir: &Path,
    stem: &str,
    dataset: &TraceDataset,
    delimiter: char,
) -> AppResult<PathBuf> {
    write_traces(dir, stem, std::slice::from_ref(dataset), delimiter)
}

/// Write the delimited data file for one or more displays. Returns its path.
///
/// The header names the first trace's source and timestamp.
pub fn write_traces(
    dir: &Path,
    stem: &str,
    traces: &[TraceDataset],
    delimiter: char,
) -> AppResult<PathBuf> {
    let delimiter = delimiter_byte(delimiter)?;
    let Some(first) = traces.first() else {
        return Err(DaqError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no trace to write",
        )));
    };
    let (path, mut out) = create(dir, format!("{stem}.txt"))?;

    writeln!(
        out,
        "# {} Measurement - Timestamp: {}",
        first.source,
        first.acquired_at.format(TIMESTAMP_FORMAT)
    )?;

    if traces.len() == 1 {
        writeln!(out, "# x [{}] / y [{}]", first.x_unit, first.y_unit)?;
        write_rows(&mut out, delimiter, point_rows(first))?;
    } else if traces.iter().all(|t| first.shares_x_axis(t)) {
        let columns: Vec<String> = traces
            .iter()
            .map(|t| format!("display {} [{}]", t.display, t.y_unit))
            .collect();
        writeln!(out, "# x [{}] / {}", first.x_unit, columns.join(" / "))?;

        let rows = first.points.iter().enumerate().map(|(index, point)| {
            let mut row = vec![point.x.to_string()];
            row.extend(
                traces
                    .iter()
                    .filter_map(|t| t.points.get(index))
                    .map(|p| p.y.to_string()),
            );
            row
        });
        write_rows(&mut out, delimiter, rows)?;
    } else {
        for trace in traces {
            writeln!(
                out,
                "# display {}: x [{}] / y [{}]",
                trace.display, trace.x_unit, trace.y_unit
            )?;
            write_rows(&mut out, delimiter, point_rows(trace))?;
        }
    }
    out.flush()?;

    let points: usize = traces.iter().map(TraceDataset::len).sum();
    info!(
        "Wrote {} points from {} display(s) to {}",
        points,
        traces.len(),
        path.display()
    );
    Ok(path)
}

/// Write the parameter readback next to the data file.
pub fn write_parameters(
    dir: &Path,
    stem: &str,
    template: &str,
    readings: &[ParameterReading],
    delimiter: char,
) -> AppResult<PathBuf> {
    let delimiter = delimiter_byte(delimiter)?;
    let (path, mut out) = create(dir, format!("{stem}_params.txt"))?;

    writeln!(
        out,
        "# {} Parameters - Timestamp: {}",
        template,
        Utc::now().format(TIMESTAMP_FORMAT)
    )?;

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(out);
    for reading in readings {
        writer
            .write_record([&reading.name, &reading.query, &reading.reply])
            .map_err(std::io::Error::from)?;
    }
    writer.flush()?;

    Ok(path)
}

/// Export a dataset (or a list of them) as pretty-printed JSON.
pub fn write_json<T>(dir: &Path, stem: &str, value: &T) -> AppResult<PathBuf>
where
    T: Serialize + ?Sized,
{
    let (path, mut out) = create(dir, format!("{stem}.json"))?;
    serde_json::to_writer_pretty(&mut out, value).map_err(std::io::Error::from)?;
    out.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use daq_core::data::Sample;
    use tempfile::tempdir;

    fn dataset() -> TraceDataset {
        TraceDataset::from_axes(
            "spectrum",
            "Hz",
            "dBV",
            vec![Sample::Value(0.0), Sample::Value(12.5), Sample::Value(25.0)],
            vec![Sample::Value(-80.5), Sample::Overflow, Sample::Underflow],
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_file_stem() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(file_stem("spectrum", at), "spectrum_20240301_123005");
    }

    #[test]
    fn test_dataset_file_layout() {
        let dir = tempdir().unwrap();
        let path = write_dataset(dir.path(), "run", &dataset(), '\t').unwrap();
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "# spectrum Measurement - Timestamp: 2024-03-01 12:30:00 UTC"
        );
        assert_eq!(lines[1], "# x [Hz] / y [dBV]");
        assert_eq!(&lines[2..], ["0\t-80.5", "12.5\toverflow", "25\tunderflow"]);
    }

    #[test]
    fn test_parameters_and_json() {
        let dir = tempdir().unwrap();
        let readings = vec![ParameterReading {
            name: "span".into(),
            query: "FSPN? 2".into(),
            reply: "102400".into(),
            value: Some(102400.0),
        }];
        let path = write_parameters(dir.path(), "run", "spectrum", &readings, ',').unwrap();
        assert!(path.ends_with("run_params.txt"));
        let text = fs::read_to_string(path).unwrap();
        assert!(text.lines().any(|l| l == "span,FSPN? 2,102400"));

        let path = write_json(dir.path(), "run", &dataset()).unwrap();
        let back: TraceDataset = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, dataset());
    }

    #[test]
    fn test_shared_axis_displays_become_columns() {
        let dir = tempdir().unwrap();
        let magnitude = dataset();
        let mut phase = dataset().with_display(1);
        phase.y_unit = "deg".into();
        phase.points[0].y = Sample::Value(-45.0);

        let path = write_traces(dir.path(), "tf", &[magnitude, phase], ',').unwrap();
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[1], "# x [Hz] / display 0 [dBV] / display 1 [deg]");
        assert_eq!(
            &lines[2..],
            ["0,-80.5,-45", "12.5,overflow,overflow", "25,underflow,underflow"]
        );
    }

    #[test]
    fn test_distinct_axes_are_stacked() {
        let dir = tempdir().unwrap();
        let second = TraceDataset::from_axes(
            "spectrum",
            "Hz",
            "V",
            vec![Sample::Value(100.0)],
            vec![Sample::Value(0.5)],
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
        )
        .unwrap()
        .with_display(1);

        let path = write_traces(dir.path(), "run", &[dataset(), second], '\t').unwrap();
        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[1], "# display 0: x [Hz] / y [dBV]");
        assert_eq!(lines[5], "# display 1: x [Hz] / y [V]");
        assert_eq!(lines[6], "100\t0.5");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_empty_trace_list_rejected() {
        let dir = tempdir().unwrap();
        assert!(write_traces(dir.path(), "run", &[], ',').is_err());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_non_ascii_delimiter_rejected() {
        let dir = tempdir().unwrap();
        assert!(write_dataset(dir.path(), "run", &dataset(), '→').is_err());
    }
}
