use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use indicatif::{ProgressBar, ProgressStyle};

use fsg::{AbortHandle, CouplingConfig, ProcessSolver, Solvers, StepResult, TimeStepOrchestrator};

const ABOUT: &str = "
Partitioned fluid-solid-growth coupling driver.

Runs external fluid, solid and mesh motion solvers to a converged interface at every growth step,
accelerating the interface iteration with IQN-ILS.";

#[derive(Parser)]
#[clap(author, about = ABOUT, name = "fsg")]
struct Opt {
    /// Path to the run configuration file.
    ///
    /// The format is determined by the extension, either `.json` or `.ron`.
    #[clap(name = "CONFIG", parse(from_os_str))]
    config: PathBuf,

    /// Continue from the checkpoint in the working directory.
    ///
    /// Without a checkpoint the run starts from the first step.
    #[clap(short, long)]
    resume: bool,

    /// Working directory, overriding the one in the configuration.
    #[clap(short, long, parse(from_os_str))]
    workdir: Option<PathBuf>,

    /// Log file path. Results of every time step are appended to it.
    #[clap(short, long, parse(from_os_str))]
    logfile: Option<PathBuf>,

    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,
}

pub fn main() {
    if let Err(err) = try_main() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn append(logfile: &Path) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
    let f = std::fs::File::options()
        .create(true)
        .append(true)
        .open(logfile)?;
    Ok(std::io::BufWriter::new(f))
}

fn write_step(logfile: &Path, result: &StepResult) -> std::io::Result<()> {
    let mut buf = append(logfile)?;
    writeln!(buf, "\nStep {}:\n{}", result.step, result)?;
    buf.flush()
}

pub fn try_main() -> Result<()> {
    let opt = Opt::parse();

    let _ = env_logger::Builder::new()
        .filter_level(opt.verbose.log_level_filter())
        .parse_env("FSG_LOG")
        .try_init();

    let mut config = CouplingConfig::load(&opt.config)?;
    if opt.resume {
        config.restart = true;
    }
    if let Some(workdir) = opt.workdir {
        config.workdir = workdir;
    }
    std::fs::create_dir_all(&config.workdir)?;

    // Write the configuration first so we know how the following log was created.
    let logfile = opt.logfile.as_deref();
    if let Some(logfile) = logfile {
        let mut buf = append(logfile)?;
        writeln!(buf, "\nConfig:\n")?;
        config.write_as_ron(&mut buf)?;
        writeln!(buf)?;
        buf.flush()?;
    }

    let abort = AbortHandle::new();
    {
        let abort = abort.clone();
        ctrlc::set_handler(move || {
            eprintln!("Interrupted, stopping running solvers");
            abort.abort();
        })?;
    }

    let solver = ProcessSolver::from_config(&config, abort.clone())?;
    let solvers = Solvers::shared(solver);
    let mut orchestrator = TimeStepOrchestrator::new(&config, &solvers, abort)?;

    let pb = ProgressBar::new(config.nmax as u64);
    pb.set_style(ProgressStyle::with_template(
        "{elapsed_precise} [{bar:40}] step {pos}/{len} {msg}",
    )?);
    pb.set_position(orchestrator.next_step() as u64);

    let result = orchestrator.run_with(|result| {
        pb.inc(1);
        pb.set_message(format!(
            "({} sub-iterations in step {})",
            result.iterations, result.step
        ));
        if let Some(logfile) = logfile {
            if let Err(err) = write_step(logfile, result) {
                log::warn!("Failed to write to {}: {}", logfile.display(), err);
            }
        }
    });

    match result {
        Ok(()) => pb.finish_with_message("done"),
        Err(_) => pb.abandon(),
    }
    result?;

    let record = orchestrator.record();
    println!(
        "Completed {} time steps, convergence record written to {}",
        record.num_steps()?,
        TimeStepOrchestrator::record_path(&config).display()
    );
    print!("{}", orchestrator.timings());
    Ok(())
}
