//! Convergence record of a run and its comparison against a reference.
//!
//! The record stores, per domain, the relative error of every sub-iteration of every time step.
//! Its JSON layout is shared with existing reference files used for regression checks.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CouplingConfig, ProcessCounts};
use crate::controller::StepResult;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to access convergence record: {0}")]
    IO(#[from] std::io::Error),
    #[error("Malformed convergence record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Inconsistent time step counts across domains: {domain} has {actual}, expected {expected}")]
    InconsistentSteps {
        domain: String,
        expected: usize,
        actual: usize,
    },
    #[error("No sub-iterations recorded for {domain} at time step {step}")]
    EmptyStep { domain: String, step: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordCoupling {
    pub method: String,
    pub tol: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordConfiguration {
    pub nmax: usize,
    pub n_procs: ProcessCounts,
    pub coup: RecordCoupling,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    /// Errors indexed by domain, time step and sub-iteration.
    pub error: BTreeMap<String, Vec<Vec<f64>>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceRecord {
    pub configuration: RecordConfiguration,
    pub convergence: Convergence,
}

/// Acceptance thresholds for [`ConvergenceRecord::compare`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Tolerances {
    /// Largest allowed difference in sub-iteration count per time step.
    pub iterations: usize,
    /// Largest allowed relative difference of the final error per time step.
    ///
    /// Used as an absolute tolerance where the reference error is zero.
    pub error: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            iterations: 2,
            error: 0.1,
        }
    }
}

/// Outcome of comparing a record against a reference.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComparisonReport {
    pub steps: usize,
    pub failures: Vec<String>,
    /// Domains present in only one of the two records.
    pub skipped: Vec<String>,
}

impl ComparisonReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Time steps: {}", self.steps)?;
        for domain in self.skipped.iter() {
            writeln!(f, "  ? {} is missing from one record, skipped", domain)?;
        }
        for failure in self.failures.iter() {
            writeln!(f, "  x {}", failure)?;
        }
        if self.passed() {
            write!(f, "Records match")
        } else {
            write!(f, "{} mismatches", self.failures.len())
        }
    }
}

impl ConvergenceRecord {
    /// An empty record for a run with the given configuration.
    pub fn new(config: &CouplingConfig) -> Self {
        ConvergenceRecord {
            configuration: RecordConfiguration {
                nmax: config.nmax,
                n_procs: config.n_procs,
                coup: RecordCoupling {
                    method: config.coup.method.name().to_string(),
                    tol: config.coup.tol,
                },
            },
            convergence: Convergence::default(),
        }
    }

    /// Appends the errors of one committed time step.
    pub fn push_step(&mut self, result: &StepResult) {
        for (domain, errors) in result.errors.iter() {
            self.convergence
                .error
                .entry(domain.name().to_string())
                .or_default()
                .push(errors.clone());
        }
    }

    /// Number of time steps, checked to agree across domains.
    pub fn num_steps(&self) -> Result<usize, RecordError> {
        let mut steps = None;
        for (domain, per_step) in self.convergence.error.iter() {
            match steps {
                None => steps = Some(per_step.len()),
                Some(expected) if expected != per_step.len() => {
                    return Err(RecordError::InconsistentSteps {
                        domain: domain.clone(),
                        expected,
                        actual: per_step.len(),
                    })
                }
                Some(_) => {}
            }
            if let Some(step) = per_step.iter().position(|e| e.is_empty()) {
                return Err(RecordError::EmptyStep {
                    domain: domain.clone(),
                    step,
                });
            }
        }
        Ok(steps.unwrap_or(0))
    }

    /// Sub-iteration count of every time step.
    pub fn iterations(&self) -> Result<Vec<usize>, RecordError> {
        self.num_steps()?;
        Ok(self
            .convergence
            .error
            .values()
            .next()
            .map(|per_step| per_step.iter().map(Vec::len).collect())
            .unwrap_or_default())
    }

    /// Error of the last sub-iteration of every time step, per domain.
    pub fn final_errors(&self) -> BTreeMap<&str, Vec<f64>> {
        self.convergence
            .error
            .iter()
            .map(|(domain, per_step)| {
                let last = per_step
                    .iter()
                    .map(|e| e.last().copied().unwrap_or(f64::NAN))
                    .collect();
                (domain.as_str(), last)
            })
            .collect()
    }

    pub fn to_json_string(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let f = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(f))?)
    }

    /// Compares `test` against `self` as the reference.
    ///
    /// Structural problems such as a differing number of time steps are errors. Threshold
    /// violations are collected in the report.
    pub fn compare(
        &self,
        test: &ConvergenceRecord,
        tol: &Tolerances,
    ) -> Result<ComparisonReport, RecordError> {
        let steps = self.num_steps()?;
        let test_steps = test.num_steps()?;
        if steps != test_steps {
            return Err(RecordError::InconsistentSteps {
                domain: "all".to_string(),
                expected: steps,
                actual: test_steps,
            });
        }

        let mut report = ComparisonReport {
            steps,
            ..Default::default()
        };

        let ref_iters = self.iterations()?;
        let test_iters = test.iterations()?;
        for (t, (&r, &s)) in ref_iters.iter().zip(test_iters.iter()).enumerate() {
            let diff = if r > s { r - s } else { s - r };
            if diff > tol.iterations {
                report.failures.push(format!(
                    "time step {}: reference={} iterations, test={} iterations",
                    t, r, s
                ));
            }
        }

        let ref_errors = self.final_errors();
        let test_errors = test.final_errors();
        for (domain, reference) in ref_errors.iter() {
            let tested = match test_errors.get(domain) {
                Some(tested) => tested,
                None => {
                    log::warn!("{} is missing from the test record", domain);
                    report.skipped.push(domain.to_string());
                    continue;
                }
            };
            for (t, (&r, &s)) in reference.iter().zip(tested.iter()).enumerate() {
                let diff = if r > 0.0 {
                    (s - r).abs() / r
                } else {
                    (s - r).abs()
                };
                if !(diff <= tol.error) {
                    report.failures.push(format!(
                        "{} at time step {}: reference={:.6e}, test={:.6e}, relative difference {:.2}%",
                        domain,
                        t,
                        r,
                        s,
                        diff * 100.0
                    ));
                }
            }
        }
        for domain in test_errors.keys().filter(|d| !ref_errors.contains_key(*d)) {
            log::warn!("{} is missing from the reference record", domain);
            report.skipped.push(domain.to_string());
        }
        Ok(report)
    }
}
