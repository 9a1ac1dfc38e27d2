//! Run configuration.
//!
//! The configuration is loaded once at startup and passed by reference to every component.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interface::{Domain, Field};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    IO(#[from] std::io::Error),
    #[error("Malformed JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed RON configuration: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("Unsupported configuration extension: '{0}'")]
    UnsupportedExtension(String),
    #[error("Invalid configuration value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Coupling or acceleration scheme.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingMethod {
    /// Interface quasi-Newton with inverse least-squares.
    IqnIls,
    /// Constant under-relaxation.
    Relax,
    /// Dynamic Aitken relaxation.
    Aitken,
}

impl CouplingMethod {
    pub fn name(self) -> &'static str {
        match self {
            CouplingMethod::IqnIls => "iqn_ils",
            CouplingMethod::Relax => "relax",
            CouplingMethod::Aitken => "aitken",
        }
    }
}

/// Number of MPI processes per domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCounts {
    pub fluid: u32,
    pub solid: u32,
    pub mesh: u32,
}

impl ProcessCounts {
    pub fn get(&self, domain: Domain) -> u32 {
        match domain {
            Domain::Fluid => self.fluid,
            Domain::Solid => self.solid,
            Domain::Mesh => self.mesh,
        }
    }
}

fn default_max_iter() -> u32 {
    100
}
fn default_omega0() -> f64 {
    0.5
}
fn default_iqn_ils_eps() -> f64 {
    1e-2
}
fn default_divergence_window() -> usize {
    5
}
fn default_blowup_factor() -> f64 {
    1e3
}
fn default_order() -> Vec<Vec<Domain>> {
    vec![vec![Domain::Mesh], vec![Domain::Fluid], vec![Domain::Solid]]
}

/// Parameters of the inner fixed-point loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CouplingParams {
    pub method: CouplingMethod,
    /// Relative residual tolerance applied to every domain.
    pub tol: f64,
    /// Maximum number of sub-iterations per time step.
    #[serde(default = "default_max_iter")]
    pub nmax: u32,
    /// Constant relaxation factor, also the initial factor for Aitken.
    #[serde(default = "default_omega0")]
    pub omega0: f64,
    /// IQN-ILS filtering threshold relative to the norm of a new column.
    #[serde(default = "default_iqn_ils_eps")]
    pub iqn_ils_eps: f64,
    /// Number of previous time steps whose IQN-ILS history is reused.
    ///
    /// Zero resets the history at every time step.
    #[serde(default)]
    pub iqn_ils_q: usize,
    /// Number of consecutive residual increases that signal divergence.
    #[serde(default = "default_divergence_window")]
    pub divergence_window: usize,
    /// Growth of the residual over its smallest value in the step that signals divergence.
    #[serde(default = "default_blowup_factor")]
    pub blowup_factor: f64,
    /// Stages of solver invocations.
    ///
    /// Domains within a stage run concurrently and read the interface as it was before the
    /// stage. Later stages see the outputs of earlier ones.
    #[serde(default = "default_order")]
    pub order: Vec<Vec<Domain>>,
}

/// Interface layout and cold start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceParams {
    pub num_nodes: usize,
    /// Uniform cold-start value per field. Missing fields start at zero.
    #[serde(default)]
    pub initial: BTreeMap<Field, f64>,
}

fn default_launcher() -> Vec<String> {
    vec!["mpiexec".to_string(), "-np".to_string()]
}

/// External solver invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Wall clock limit for one invocation in seconds.
    pub timeout: f64,
    /// Number of relaunches after a failed invocation within one sub-iteration.
    pub retries: u32,
    /// Launcher prefix. The process count of the domain is appended after it.
    ///
    /// An empty launcher runs the executable directly.
    pub launcher: Vec<String>,
    pub exe: BTreeMap<Domain, PathBuf>,
    pub args: BTreeMap<Domain, Vec<String>>,
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverParams {
            timeout: 3600.0,
            retries: 1,
            launcher: default_launcher(),
            exe: BTreeMap::new(),
            args: BTreeMap::new(),
        }
    }
}

/// Growth and remodeling rates.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowthParams {
    /// Time increment of one growth step.
    pub dt: f64,
    /// Mass production gain per unit stimulus and time.
    pub gain: f64,
}

impl Default for GrowthParams {
    fn default() -> Self {
        GrowthParams { dt: 1.0, gain: 0.0 }
    }
}

/// What to do when a time step fails to converge.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepRetryParams {
    /// Zero aborts the run on the first failed step.
    pub max_retries: u32,
    /// Factor applied to the time increment for every retry.
    pub reduction: f64,
}

impl Default for StepRetryParams {
    fn default() -> Self {
        StepRetryParams {
            max_retries: 0,
            reduction: 0.5,
        }
    }
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

/// Complete configuration of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Number of growth time steps.
    pub nmax: usize,
    pub n_procs: ProcessCounts,
    pub coup: CouplingParams,
    pub interface: InterfaceParams,
    #[serde(default)]
    pub solver: SolverParams,
    #[serde(default)]
    pub growth: GrowthParams,
    #[serde(default)]
    pub step_retry: StepRetryParams,
    /// Root of exchange directories, checkpoints and records.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Resume from the checkpoint in `workdir` if one exists.
    #[serde(default)]
    pub restart: bool,
}

impl CouplingConfig {
    /// Loads a configuration, choosing the format by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<CouplingConfig, ConfigError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|x| x.to_str())
            .unwrap_or_default();
        let config = match ext {
            "json" => Self::load_from_json(path)?,
            "ron" => Self::load_from_ron(path)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn load_from_json(path: impl AsRef<Path>) -> Result<CouplingConfig, ConfigError> {
        let f = File::open(path.as_ref())?;
        let config: CouplingConfig = serde_json::from_reader(std::io::BufReader::new(f))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_ron(path: impl AsRef<Path>) -> Result<CouplingConfig, ConfigError> {
        let f = File::open(path.as_ref())?;
        let config: CouplingConfig = ron::de::from_reader(f)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<CouplingConfig, ConfigError> {
        let config: CouplingConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty RON, useful to document how a log was produced.
    pub fn write_as_ron<W: std::io::Write>(&self, w: W) -> Result<(), ron::Error> {
        ron::ser::to_writer_pretty(w, self, ron::ser::PrettyConfig::new())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.solver.timeout)
    }

    /// Checks value ranges and the stage order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let coup = &self.coup;
        if !(coup.tol > 0.0) || !coup.tol.is_finite() {
            return Err(invalid("coup.tol", format!("must be positive, got {}", coup.tol)));
        }
        if coup.nmax == 0 {
            return Err(invalid("coup.nmax", "must be at least 1"));
        }
        if !(coup.omega0 > 0.0 && coup.omega0 <= 1.0) {
            return Err(invalid(
                "coup.omega0",
                format!("must be in (0, 1], got {}", coup.omega0),
            ));
        }
        if !(coup.iqn_ils_eps >= 0.0) {
            return Err(invalid("coup.iqn_ils_eps", "must be non-negative"));
        }
        if coup.divergence_window == 0 {
            return Err(invalid("coup.divergence_window", "must be at least 1"));
        }
        if !(coup.blowup_factor > 1.0) {
            return Err(invalid("coup.blowup_factor", "must be greater than 1"));
        }
        if self.interface.num_nodes == 0 {
            return Err(invalid("interface.num_nodes", "must be positive"));
        }
        for domain in Domain::ALL {
            if self.n_procs.get(domain) == 0 {
                return Err(invalid(
                    "n_procs",
                    format!("{} needs at least one process", domain),
                ));
            }
        }
        if !(self.solver.timeout > 0.0) || !self.solver.timeout.is_finite() {
            return Err(invalid("solver.timeout", "must be a positive number of seconds"));
        }
        if !(self.growth.dt > 0.0) {
            return Err(invalid("growth.dt", "must be positive"));
        }
        if !(self.step_retry.reduction > 0.0 && self.step_retry.reduction < 1.0) {
            return Err(invalid("step_retry.reduction", "must be in (0, 1)"));
        }
        validate_order(&coup.order)
    }
}

/// Every domain must appear exactly once.
fn validate_order(order: &[Vec<Domain>]) -> Result<(), ConfigError> {
    let mut seen = Vec::new();
    for stage in order {
        if stage.is_empty() {
            return Err(invalid("coup.order", "empty stage"));
        }
        for &domain in stage {
            if seen.contains(&domain) {
                return Err(invalid("coup.order", format!("{} appears twice", domain)));
            }
            seen.push(domain);
        }
    }
    if let Some(missing) = Domain::ALL.iter().find(|d| !seen.contains(d)) {
        return Err(invalid("coup.order", format!("{} is never invoked", missing)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "nmax": 2,
        "n_procs": { "fluid": 4, "solid": 1, "mesh": 1 },
        "coup": { "method": "iqn_ils", "tol": 1e-3 },
        "interface": { "num_nodes": 8 },
        "unrelated": { "plotting": true }
    }"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = CouplingConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.nmax, 2);
        assert_eq!(config.coup.method, CouplingMethod::IqnIls);
        assert_eq!(config.coup.nmax, 100);
        assert_eq!(config.coup.iqn_ils_q, 0);
        assert_eq!(config.coup.order, default_order());
        assert_eq!(config.solver.launcher, default_launcher());
        assert_eq!(config.step_retry.max_retries, 0);
        assert_eq!(config.n_procs.get(Domain::Fluid), 4);
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let without_tol = MINIMAL.replace(r#", "tol": 1e-3"#, "");
        assert!(matches!(
            CouplingConfig::from_json_str(&without_tol),
            Err(ConfigError::Json(_))
        ));
        let without_nmax = MINIMAL.replace(r#""nmax": 2,"#, "");
        assert!(CouplingConfig::from_json_str(&without_nmax).is_err());
    }

    #[test]
    fn unknown_method_is_an_error() {
        let bad = MINIMAL.replace("iqn_ils", "broyden");
        assert!(CouplingConfig::from_json_str(&bad).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad = MINIMAL.replace("1e-3", "-1.0");
        assert!(matches!(
            CouplingConfig::from_json_str(&bad),
            Err(ConfigError::Invalid { key: "coup.tol", .. })
        ));
        let bad = MINIMAL.replace(r#""num_nodes": 8"#, r#""num_nodes": 0"#);
        assert!(matches!(
            CouplingConfig::from_json_str(&bad),
            Err(ConfigError::Invalid {
                key: "interface.num_nodes",
                ..
            })
        ));
    }

    #[test]
    fn stage_order_is_checked() {
        assert!(validate_order(&default_order()).is_ok());
        assert!(validate_order(&[vec![Domain::Mesh, Domain::Solid], vec![Domain::Fluid]]).is_ok());
        assert!(validate_order(&[vec![Domain::Mesh], vec![], vec![Domain::Fluid, Domain::Solid]]).is_err());
        assert!(validate_order(&[vec![Domain::Mesh], vec![Domain::Fluid]]).is_err());
        assert!(validate_order(&[
            vec![Domain::Mesh],
            vec![Domain::Fluid],
            vec![Domain::Solid, Domain::Mesh]
        ])
        .is_err());
    }

    #[test]
    fn initial_values_by_field_name() {
        let with_initial = MINIMAL.replace(
            r#""num_nodes": 8"#,
            r#""num_nodes": 8, "initial": { "displacement": 0.1, "wss": 2.0 }"#,
        );
        let config = CouplingConfig::from_json_str(&with_initial).unwrap();
        assert_eq!(config.interface.initial[&Field::Displacement], 0.1);
        assert_eq!(config.interface.initial[&Field::WallShearStress], 2.0);
    }
}
