//! File protocol between the coupling driver and the external solvers.
//!
//! For every invocation the driver writes one `<field>.in.json` per consumed field into the
//! working directory, and expects one `<field>.out.json` per produced field after the solver
//! exits. The solid domain additionally receives `growth.json`.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interface::{Field, InterfaceState, InterfaceVector};

pub const GROWTH_FILE: &str = "growth.json";

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Missing exchange file {}", .0.display())]
    Missing(PathBuf),
    #[error("Exchange file IO error on {}: {source}", .path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed exchange file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid exchange file {}: {reason}", .path.display())]
    Schema { path: PathBuf, reason: String },
}

/// On-disk representation of one interface field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFile {
    pub field: String,
    pub num_nodes: usize,
    pub components: usize,
    pub values: Vec<f64>,
}

impl FieldFile {
    fn new(field: Field, num_nodes: usize, values: &InterfaceVector) -> Self {
        FieldFile {
            field: field.name().to_string(),
            num_nodes,
            components: field.components(),
            values: values.iter().copied().collect(),
        }
    }

    /// Checks the contents against the domain contract for `field`.
    fn validate(&self, field: Field, num_nodes: usize) -> Result<(), String> {
        if self.field != field.name() {
            return Err(format!(
                "field name is {:?}, expected {:?}",
                self.field,
                field.name()
            ));
        }
        if self.num_nodes != num_nodes {
            return Err(format!(
                "{} nodes, expected {}",
                self.num_nodes, num_nodes
            ));
        }
        if self.components != field.components() {
            return Err(format!(
                "{} components, expected {}",
                self.components,
                field.components()
            ));
        }
        if self.values.len() != num_nodes * field.components() {
            return Err(format!(
                "{} values, expected {}",
                self.values.len(),
                num_nodes * field.components()
            ));
        }
        if let Some(i) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(format!("non-finite value at entry {}", i));
        }
        Ok(())
    }
}

pub fn input_path(dir: &Path, field: Field) -> PathBuf {
    dir.join(format!("{}.in.json", field.name()))
}

pub fn output_path(dir: &Path, field: Field) -> PathBuf {
    dir.join(format!("{}.out.json", field.name()))
}

/// Serializes `value` as JSON into `path`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExchangeError> {
    let io_err = |source| ExchangeError::IO {
        path: path.to_path_buf(),
        source,
    };
    let f = File::create(path).map_err(io_err)?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer(&mut w, value).map_err(|source| ExchangeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::io::Write::flush(&mut w).map_err(io_err)
}

/// Writes every field of `state` as an input file into `dir`.
pub fn write_inputs(dir: &Path, state: &InterfaceState) -> Result<(), ExchangeError> {
    for (field, values) in state.iter() {
        let path = input_path(dir, field);
        write_json(&path, &FieldFile::new(field, state.num_nodes(), values))?;
    }
    Ok(())
}

/// Writes a field as a solver output. Used by solver wrappers and tests.
pub fn write_output(
    dir: &Path,
    field: Field,
    num_nodes: usize,
    values: &InterfaceVector,
) -> Result<(), ExchangeError> {
    write_json(&output_path(dir, field), &FieldFile::new(field, num_nodes, values))
}

/// Reads and validates a single field file.
pub fn read_field(path: &Path, field: Field, num_nodes: usize) -> Result<InterfaceVector, ExchangeError> {
    if !path.is_file() {
        return Err(ExchangeError::Missing(path.to_path_buf()));
    }
    let f = File::open(path).map_err(|source| ExchangeError::IO {
        path: path.to_path_buf(),
        source,
    })?;
    let file: FieldFile =
        serde_json::from_reader(BufReader::new(f)).map_err(|source| ExchangeError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    file.validate(field, num_nodes)
        .map_err(|reason| ExchangeError::Schema {
            path: path.to_path_buf(),
            reason,
        })?;
    Ok(InterfaceVector::from_vec(file.values))
}

/// Reads all `fields` written by a solver into `dir`.
pub fn read_outputs(
    dir: &Path,
    fields: &[Field],
    num_nodes: usize,
) -> Result<InterfaceState, ExchangeError> {
    let mut state = InterfaceState::new(num_nodes);
    for &field in fields {
        let path = output_path(dir, field);
        let values = read_field(&path, field, num_nodes)?;
        // Sizes were checked against the contract above.
        state
            .insert(field, values)
            .map_err(|e| ExchangeError::Schema {
                path,
                reason: e.to_string(),
            })?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_is_read_back() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let values = InterfaceVector::from_vec(vec![0.5, 1.5]);
        write_output(dir, Field::WallShearStress, 2, &values).unwrap();
        let state = read_outputs(dir, &[Field::WallShearStress], 2).unwrap();
        assert_eq!(state.get(Field::WallShearStress), Some(&values));
    }

    #[test]
    fn missing_output_is_reported() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        assert!(matches!(
            read_outputs(dir, &[Field::Traction], 2),
            Err(ExchangeError::Missing(_))
        ));
    }

    #[test]
    fn schema_violations_are_reported() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path();
        let path = output_path(dir, Field::Displacement);

        // Wrong field name.
        let file = FieldFile {
            field: "traction".to_string(),
            num_nodes: 1,
            components: 3,
            values: vec![0.0; 3],
        };
        write_json(&path, &file).unwrap();
        assert!(matches!(
            read_field(&path, Field::Displacement, 1),
            Err(ExchangeError::Schema { .. })
        ));

        // Truncated values.
        let file = FieldFile {
            field: "displacement".to_string(),
            num_nodes: 1,
            components: 3,
            values: vec![0.0; 2],
        };
        write_json(&path, &file).unwrap();
        assert!(matches!(
            read_field(&path, Field::Displacement, 1),
            Err(ExchangeError::Schema { .. })
        ));

        // Not JSON at all.
        std::fs::write(&path, "displacement 0 0 0").unwrap();
        assert!(matches!(
            read_field(&path, Field::Displacement, 1),
            Err(ExchangeError::Parse { .. })
        ));
    }
}
