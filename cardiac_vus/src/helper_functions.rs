use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use polars::prelude::*;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{PipelineError, Result};

/// Read a CSV with every column kept as a string. Typing happens in the
/// caller, by column name, so a chromosome column holding both `1` and `X`
/// never trips schema inference.
pub fn read_csv(file_path: &Path) -> Result<DataFrame> {
    File::open(file_path).map_err(|source| PipelineError::Unreadable {
        path: file_path.to_path_buf(),
        source,
    })?;

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(PathBuf::from(file_path)))?
        .finish()?;
    Ok(df)
}

/// Fail with the full list of absent columns, not just the first one.
pub fn require_columns(df: &DataFrame, path: &Path, required: &[&str], expected: &str) -> Result<()> {
    let present: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !present.iter().any(|p| p == *name))
        .map(|s| s.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::MissingColumns {
            path: path.to_path_buf(),
            missing,
            expected: expected.to_string(),
        })
    }
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

pub fn string_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let casted = df.column(name)?.cast(&DataType::String)?;
    let values = casted
        .str()?
        .into_iter()
        .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        .collect();
    Ok(values)
}

/// Non-parseable cells come back as `None`.
pub fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let casted = df.column(name)?.cast(&DataType::Float64)?;
    Ok(casted.f64()?.into_iter().collect())
}

/// Like [`float_column`] but every cell must hold a number.
pub fn required_float_column(df: &DataFrame, path: &Path, name: &str) -> Result<Vec<f64>> {
    float_column(df, name)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.filter(|x| x.is_finite()).ok_or_else(|| {
                PipelineError::malformed(path, format!("row {}: column `{}` is not a finite number", i + 1, name))
            })
        })
        .collect()
}

/// Plain or gzip/bgzip text input; bgzip files are multi-member, hence the
/// multi-member decoder.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|source| PipelineError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let gzipped = path
        .extension()
        .map_or(false, |e| e == "gz" || e == "bgz");
    if gzipped {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomic output
// ─────────────────────────────────────────────────────────────────────────────

/// Write into a temp file next to `path` and rename it into place once the
/// writer returns successfully. Readers see either the old file or the
/// complete new one.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

pub fn dataframe_to_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    write_atomic(path, |file| {
        CsvWriter::new(file)
            .include_header(true)
            .with_separator(b',')
            .finish(df)?;
        Ok(())
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |file| {
        serde_json::to_writer_pretty(&mut *file, value)?;
        writeln!(file)?;
        Ok(())
    })
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|source| PipelineError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PipelineError::malformed(path, format!("invalid JSON: {e}")))
}

/// Remove a file if present; a missing file is not an error.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    #[test]
    fn csv_roundtrip_keeps_mixed_chromosomes_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let mut df = df![
            "chrom" => &["1", "X"],
            "score" => &[0.5, -999.0]
        ]
        .unwrap();
        dataframe_to_csv(&mut df, &path).unwrap();

        let back = read_csv(&path).unwrap();
        assert_eq!(
            string_column(&back, "chrom").unwrap(),
            vec![Some("1".to_string()), Some("X".to_string())]
        );
        assert_eq!(
            required_float_column(&back, &path, "score").unwrap(),
            vec![0.5, -999.0]
        );
    }

    #[test]
    fn missing_columns_are_all_reported() {
        let df = df!["a" => &[1i64]].unwrap();
        let err = require_columns(&df, Path::new("x.csv"), &["a", "b", "c"], "a,b,c").unwrap_err();
        match err {
            PipelineError::MissingColumns { missing, .. } => assert_eq!(missing, vec!["b", "c"]),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unreadable_input_is_a_source_error() {
        let err = read_csv(Path::new("/definitely/not/here.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::Unreadable { .. }));
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_json(&path, &vec![1, 2, 3]).unwrap();
        write_json(&path, &vec![4]).unwrap();
        let back: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(back, vec![4]);
        // no temp files left behind
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
