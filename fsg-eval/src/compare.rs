use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

use fsg::record::{ConvergenceRecord, Tolerances};

const ABOUT: &str = "
Compares a convergence record against a reference.

Both records must have the same number of time steps. Every step must use a similar number of
sub-iterations and end with a similar error.";

#[derive(Parser)]
#[clap(author, about = ABOUT, name = "fsg-compare")]
struct Opt {
    /// Reference convergence record.
    #[clap(name = "REFERENCE", parse(from_os_str))]
    reference: PathBuf,

    /// Convergence record under test.
    #[clap(name = "TEST", parse(from_os_str))]
    test: PathBuf,

    /// Largest allowed difference in sub-iteration count per time step.
    #[clap(short, long, default_value = "2")]
    iter_tolerance: usize,

    /// Largest allowed relative difference of the final error per time step.
    #[clap(short, long, default_value = "0.1")]
    error_tolerance: f64,

    #[clap(flatten)]
    verbose: Verbosity<WarnLevel>,
}

pub fn main() {
    match try_main() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    }
}

/// Returns whether the records match.
pub fn try_main() -> Result<bool> {
    let opt = Opt::parse();

    let _ = env_logger::Builder::new()
        .filter_level(opt.verbose.log_level_filter())
        .parse_env("FSG_LOG")
        .try_init();

    let reference = ConvergenceRecord::load(&opt.reference)?;
    let test = ConvergenceRecord::load(&opt.test)?;
    if reference.configuration != test.configuration {
        log::warn!(
            "Records were produced with different configurations: {:?} and {:?}",
            reference.configuration,
            test.configuration
        );
    }

    let tol = Tolerances {
        iterations: opt.iter_tolerance,
        error: opt.error_tolerance,
    };
    let report = reference.compare(&test, &tol)?;
    println!("{}", report);
    Ok(report.passed())
}
