use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use super::{AbortHandle, SolverAdapter, SolverError};
use crate::config::{ConfigError, CouplingConfig, ProcessCounts};
use crate::exchange;
use crate::growth::GrowthState;
use crate::interface::{Domain, InterfaceState};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs an external solver executable as a subprocess inside the working directory.
///
/// The command line is `<launcher..> <n_procs> <exe> <args..>` when a launcher is configured,
/// and `<exe> <args..>` otherwise. Standard output and error are captured in `<domain>.log`.
pub struct ProcessSolver {
    launcher: Vec<String>,
    n_procs: ProcessCounts,
    exe: BTreeMap<Domain, PathBuf>,
    args: BTreeMap<Domain, Vec<String>>,
    timeout: Duration,
    abort: AbortHandle,
}

impl ProcessSolver {
    /// Builds the adapter from the `solver` section.
    ///
    /// Every domain needs an executable.
    pub fn from_config(config: &CouplingConfig, abort: AbortHandle) -> Result<Self, ConfigError> {
        if let Some(missing) = Domain::ALL
            .iter()
            .find(|d| !config.solver.exe.contains_key(d))
        {
            return Err(ConfigError::Invalid {
                key: "solver.exe",
                reason: format!("no executable for {}", missing),
            });
        }
        Ok(ProcessSolver {
            launcher: config.solver.launcher.clone(),
            n_procs: config.n_procs,
            exe: config.solver.exe.clone(),
            args: config.solver.args.clone(),
            timeout: config.timeout(),
            abort,
        })
    }

    /// The command that would be launched for `domain`, without a working directory.
    pub fn command(&self, domain: Domain) -> Result<Command, SolverError> {
        let exe = self
            .exe
            .get(&domain)
            .ok_or(SolverError::NotConfigured { domain })?;
        let mut cmd = if let Some((program, rest)) = self.launcher.split_first() {
            let mut cmd = Command::new(program);
            cmd.args(rest)
                .arg(self.n_procs.get(domain).to_string())
                .arg(exe);
            cmd
        } else {
            Command::new(exe)
        };
        if let Some(args) = self.args.get(&domain) {
            cmd.args(args);
        }
        Ok(cmd)
    }

    /// Waits for `child`, killing it on timeout or abort.
    fn wait(&self, domain: Domain, child: &mut Child) -> Result<ExitStatus, SolverError> {
        let start = Instant::now();
        let mut interval = MIN_POLL_INTERVAL;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    kill(child);
                    return Err(SolverError::LaunchFailure { domain, source });
                }
            }
            if self.abort.is_aborted() {
                log::warn!("Abort requested, killing {} solver", domain);
                kill(child);
                return Err(SolverError::Interrupted { domain });
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                log::warn!("{} solver exceeded {:?}, killing it", domain, self.timeout);
                kill(child);
                return Err(SolverError::Timeout {
                    domain,
                    after: elapsed,
                });
            }
            std::thread::sleep(interval.min(self.timeout - elapsed));
            interval = (interval * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

fn kill(child: &mut Child) {
    // The process may have exited between the last poll and now.
    let _ = child.kill();
    let _ = child.wait();
}

impl SolverAdapter for ProcessSolver {
    fn run(
        &self,
        domain: Domain,
        input: &InterfaceState,
        growth: &GrowthState,
        workdir: &Path,
    ) -> Result<InterfaceState, SolverError> {
        if self.abort.is_aborted() {
            return Err(SolverError::Interrupted { domain });
        }
        let prepare_err = |source| SolverError::Prepare { domain, source };

        std::fs::create_dir_all(workdir).map_err(|source| {
            prepare_err(exchange::ExchangeError::IO {
                path: workdir.to_path_buf(),
                source,
            })
        })?;
        exchange::write_inputs(workdir, input).map_err(prepare_err)?;
        if domain == Domain::Solid {
            exchange::write_json(&workdir.join(exchange::GROWTH_FILE), growth)
                .map_err(prepare_err)?;
        }

        let log_path = workdir.join(format!("{}.log", domain));
        let launch_err = |source| SolverError::LaunchFailure { domain, source };
        let stdout = File::create(&log_path).map_err(launch_err)?;
        let stderr = stdout.try_clone().map_err(launch_err)?;

        let mut cmd = self.command(domain)?;
        cmd.current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        log::debug!("Launching {} solver: {:?}", domain, cmd);

        let mut child = cmd.spawn().map_err(launch_err)?;
        let status = self.wait(domain, &mut child)?;
        if !status.success() {
            log::error!(
                "{} solver failed with {}, see {}",
                domain,
                status,
                log_path.display()
            );
            return Err(SolverError::ExecutionFailure {
                domain,
                code: status.code(),
            });
        }

        exchange::read_outputs(workdir, domain.outputs(), input.num_nodes())
            .map_err(|source| SolverError::OutputFormat { domain, source })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{CouplingMethod, CouplingParams, InterfaceParams};
    use crate::interface::{Field, InterfaceVector};

    fn config(script: &str, timeout: f64) -> CouplingConfig {
        let mut config = CouplingConfig {
            nmax: 1,
            n_procs: ProcessCounts {
                fluid: 1,
                solid: 1,
                mesh: 1,
            },
            coup: CouplingParams {
                method: CouplingMethod::Relax,
                tol: 1e-3,
                nmax: 10,
                omega0: 0.5,
                iqn_ils_eps: 1e-2,
                iqn_ils_q: 0,
                divergence_window: 5,
                blowup_factor: 1e3,
                order: vec![vec![Domain::Mesh], vec![Domain::Fluid], vec![Domain::Solid]],
            },
            interface: InterfaceParams {
                num_nodes: 1,
                initial: Default::default(),
            },
            solver: Default::default(),
            growth: Default::default(),
            step_retry: Default::default(),
            workdir: PathBuf::from("."),
            restart: false,
        };
        config.solver.launcher = Vec::new();
        config.solver.timeout = timeout;
        for domain in Domain::ALL {
            config.solver.exe.insert(domain, PathBuf::from("sh"));
            config
                .solver
                .args
                .insert(domain, vec!["-c".to_string(), script.to_string()]);
        }
        config
    }

    fn run(script: &str, timeout: f64) -> Result<InterfaceState, SolverError> {
        let workdir = tempfile::tempdir().unwrap();
        let solver = ProcessSolver::from_config(&config(script, timeout), AbortHandle::new()).unwrap();
        let input = InterfaceState::cold_start(1, &Default::default())
            .subset(Domain::Mesh.inputs())
            .unwrap();
        solver.run(Domain::Mesh, &input, &GrowthState::new(1), workdir.path())
    }

    #[test]
    fn launcher_prefix() {
        let mut config = config("true", 1.0);
        config.solver.launcher = vec!["mpiexec".to_string(), "-np".to_string()];
        config.n_procs.fluid = 8;
        let solver = ProcessSolver::from_config(&config, AbortHandle::new()).unwrap();
        let cmd = solver.command(Domain::Fluid).unwrap();
        assert_eq!(cmd.get_program(), "mpiexec");
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["-np", "8", "sh", "-c", "true"]);
    }

    #[test]
    fn missing_executable_is_a_config_error() {
        let mut config = config("true", 1.0);
        config.solver.exe.remove(&Domain::Solid);
        assert!(ProcessSolver::from_config(&config, AbortHandle::new()).is_err());
    }

    #[test]
    fn reads_solver_output() {
        let script = r#"sed 's/"displacement"/"mesh_displacement"/' displacement.in.json > mesh_displacement.out.json"#;
        let out = run(script, 10.0).unwrap();
        assert_eq!(
            out.get(Field::MeshDisplacement),
            Some(&InterfaceVector::zeros(3))
        );
    }

    #[test]
    fn nonzero_exit_is_execution_failure() {
        assert!(matches!(
            run("exit 3", 10.0),
            Err(SolverError::ExecutionFailure {
                domain: Domain::Mesh,
                code: Some(3)
            })
        ));
    }

    #[test]
    fn missing_output_is_format_error() {
        assert!(matches!(
            run("true", 10.0),
            Err(SolverError::OutputFormat { .. })
        ));
    }

    #[test]
    fn hanging_solver_times_out() {
        let start = Instant::now();
        assert!(matches!(
            run("sleep 30", 0.2),
            Err(SolverError::Timeout { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn aborted_before_launch() {
        let workdir = tempfile::tempdir().unwrap();
        let abort = AbortHandle::new();
        let solver = ProcessSolver::from_config(&config("true", 1.0), abort.clone()).unwrap();
        abort.abort();
        let input = InterfaceState::cold_start(1, &Default::default());
        assert!(matches!(
            solver.run(Domain::Mesh, &input, &GrowthState::new(1), workdir.path()),
            Err(SolverError::Interrupted { .. })
        ));
    }
}
