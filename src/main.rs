use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::unbounded;
use log::{info, warn};
use regex::Regex;
use serde::Serialize;

use propcalc::engine::registry::{self, PotentialRef};
use propcalc::interface::config::{CalculationConfig, JobConfig};
use propcalc::interface::progress::{RunProgress, RunStatus};
use propcalc::interface::report::{self, RunSummary};
use propcalc::io;
use propcalc::analysis::moduli::EV_PER_A3_TO_GPA;
use propcalc::solvers::batch::{BatchExecutor, BatchItem, Parallelism};
use propcalc::solvers::elasticity::{ElasticConfig, ElasticResult, ElasticityEngine};
use propcalc::solvers::phonon::{PhononConfig, PhononEngine, PhononResult};
use propcalc::solvers::relax::{RelaxConfig, RelaxResult, RelaxationEngine};
use propcalc::solvers::surface::{SurfaceConfig, SurfaceEnergyEngine, SurfaceResult};
use propcalc::solvers::PropertyCalculator;
use propcalc::Structure;

const PROGRESS_TICK: Duration = Duration::from_millis(100);

// --- CLI Definitions ---

#[derive(Parser, Debug)]
#[command(author, version, about = "Property calculators over pluggable interatomic potentials", long_about = None)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a JSON job file
    Run {
        job: PathBuf,
        /// Output directory (overrides the job file)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Worker count (overrides the job file; 0 = all cores)
        #[arg(short, long)]
        jobs: Option<i64>,
    },
    /// Relax atoms and cell
    Relax {
        #[command(flatten)]
        common: CommonArgs,
        /// Keep the cell fixed
        #[arg(long)]
        fixed_cell: bool,
        #[arg(long, default_value_t = 0.1)]
        fmax: f64,
        #[arg(long, default_value_t = 500)]
        max_steps: usize,
    },
    /// Surface energies of one (hkl) orientation
    Surface {
        #[command(flatten)]
        common: CommonArgs,
        /// Miller indices: "111", "1,1,0" or "(1 -1 0)"
        #[arg(short, long, default_value = "100", value_parser = parse_miller)]
        miller: [i32; 3],
        /// Minimum slab thickness (Å)
        #[arg(long, default_value_t = 10.0)]
        slab: f64,
        /// Minimum vacuum (Å)
        #[arg(long, default_value_t = 20.0)]
        vacuum: f64,
    },
    /// Finite-displacement phonons and thermal properties
    Phonon {
        #[command(flatten)]
        common: CommonArgs,
        /// Diagonal supercell: "2x2x2" or "3,3,2"
        #[arg(short, long, default_value = "2x2x2", value_parser = parse_supercell)]
        supercell: [i32; 3],
        /// Displacement amplitude (Å)
        #[arg(long, default_value_t = 0.01)]
        displacement: f64,
    },
    /// Elastic constants from stress-strain fits
    Elastic {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List registered potentials and their aliases
    Potentials,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// POSCAR/CONTCAR/*.vasp or *.json structure files
    #[arg(required = true)]
    structures: Vec<PathBuf>,
    /// Registered potential name or alias
    #[arg(short, long, default_value = "default")]
    potential: String,
    #[arg(short, long, default_value = "propcalc-output")]
    output: PathBuf,
    /// Worker count (0 = all cores)
    #[arg(short, long, default_value_t = 0)]
    jobs: i64,
}

// --- Argument parsers ---

/// Three integers, either separated ("1,-1,0", "2x2x2") or written
/// compactly with single digits ("1-10").
fn parse_triple(text: &str) -> Result<[i32; 3], String> {
    let separated = text.contains([',', ' ', 'x', 'X']);
    let pattern = if separated { r"-?\d+" } else { r"-?\d" };
    let re = Regex::new(pattern).map_err(|e| e.to_string())?;
    let values: Vec<i32> = re
        .find_iter(text)
        .map(|m| m.as_str().parse::<i32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        &[a, b, c] => Ok([a, b, c]),
        _ => Err(format!("expected three integers, got '{}'", text)),
    }
}

fn parse_miller(text: &str) -> Result<[i32; 3], String> {
    let hkl = parse_triple(text)?;
    if hkl == [0, 0, 0] {
        return Err("Miller indices cannot all be zero".to_string());
    }
    Ok(hkl)
}

fn parse_supercell(text: &str) -> Result<[i32; 3], String> {
    let n = parse_triple(text)?;
    if n.iter().any(|&x| x < 1) {
        return Err(format!("supercell repeats must be positive, got '{}'", text));
    }
    Ok(n)
}

// --- Batch plumbing ---

struct Batch {
    structures: Vec<Structure>,
    potential: PotentialRef,
    parallelism: Parallelism,
    output_dir: PathBuf,
}

impl Batch {
    fn from_common(common: &CommonArgs) -> Result<Self> {
        let structures = common
            .structures
            .iter()
            .map(|p| io::read_structure(p).with_context(|| format!("Failed to read structure '{}'", p.display())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            structures,
            potential: PotentialRef::Named(common.potential.clone()),
            parallelism: Parallelism::from_jobs(common.jobs),
            output_dir: common.output.clone(),
        })
    }

    /// Runs `calculator` over every structure and hands each success to `write`.
    fn execute<C, W>(&self, calculator: &C, write: W) -> Result<()>
    where
        C: PropertyCalculator,
        W: Fn(&Path, &str, &C::Output) -> Result<()>,
    {
        let factory = self
            .potential
            .factory()
            .context("Failed to resolve potential")?;
        let potential_name = factory()
            .context("Failed to load potential")?
            .name()
            .to_string();

        let (tx, rx) = unbounded();
        let total = self.structures.len();
        let listener = thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                let mut progress = RunProgress::new(total);
                loop {
                    for line in progress.drain(&rx) {
                        info!("{}", line);
                    }
                    if progress.status == RunStatus::Finished {
                        break;
                    }
                    thread::sleep(PROGRESS_TICK);
                }
                progress
            })?;

        let started_at = Utc::now();
        let executor = BatchExecutor::new(self.parallelism).with_events(tx);
        let outcome = executor.run(calculator, &self.structures, factory);
        drop(executor);
        let progress = listener
            .join()
            .map_err(|_| anyhow!("progress listener panicked"))?;
        let items = outcome.with_context(|| format!("{} batch aborted", calculator.name()))?;

        report::ensure_dir(&self.output_dir)?;
        for item in &items {
            if let Ok(output) = &item.outcome {
                let stem = format!("{:03}_{}", item.index, report::file_stem(&item.label));
                write(&self.output_dir, &stem, output)
                    .with_context(|| format!("Failed to write results for '{}'", item.label))?;
            }
        }

        let summaries = items.iter().map(BatchItem::summary).collect();
        let summary = RunSummary::new(calculator.name(), &potential_name, started_at, summaries);
        let path = summary.write(&self.output_dir)?;
        info!(
            "Wrote {} ({:.1} s wall time)",
            path.display(),
            progress.elapsed_secs()
        );

        if summary.failed > 0 {
            bail!("{} of {} structures failed", summary.failed, items.len());
        }
        if progress.unconverged > 0 {
            warn!("{} structures finished without converging", progress.unconverged);
        }
        Ok(())
    }
}

fn write_json<T: Serialize>(dir: &Path, stem: &str, suffix: &str, value: &T) -> Result<()> {
    report::write_json(&dir.join(format!("{}.{}.json", stem, suffix)), value)?;
    Ok(())
}

fn write_relax(dir: &Path, stem: &str, result: &RelaxResult) -> Result<()> {
    info!(
        "{}: E = {:.6} eV ({:.6} eV/atom) after {} steps",
        stem,
        result.energy,
        result.energy_per_atom(),
        result.iterations
    );
    io::write_structure(&dir.join(format!("{}.relaxed.vasp", stem)), &result.structure)?;
    write_json(dir, stem, "relax", result)
}

fn write_surface(dir: &Path, stem: &str, result: &SurfaceResult) -> Result<()> {
    if let Some(best) = result.lowest() {
        info!(
            "{}: lowest γ{:?} = {:.4} J/m² (termination {})",
            stem,
            result.miller,
            best.surface_energy_j_per_m2(),
            best.termination
        );
    }
    write_json(dir, stem, "surface", result)
}

fn write_phonon(dir: &Path, stem: &str, result: &PhononResult) -> Result<()> {
    if result.imaginary_modes > 0 {
        warn!("{}: {} imaginary modes on the mesh", stem, result.imaginary_modes);
    }
    report::write_phonon_artifacts(dir, stem, result)?;
    Ok(())
}

fn write_elastic(dir: &Path, stem: &str, result: &ElasticResult) -> Result<()> {
    let m = result.moduli.scaled(EV_PER_A3_TO_GPA);
    match (m.k_vrh, m.g_vrh, m.poisson_ratio) {
        (Some(k), Some(g), Some(nu)) => {
            info!("{}: K_VRH = {:.2} GPa, G_VRH = {:.2} GPa, ν = {:.3}", stem, k, g, nu)
        }
        _ => warn!(
            "{}: singular stiffness, K_V = {:.2} GPa, G_V = {:.2} GPa",
            stem, m.k_voigt, m.g_voigt
        ),
    }
    write_json(dir, stem, "elastic", result)
}

fn run_calculation(batch: &Batch, calculation: CalculationConfig) -> Result<()> {
    match calculation {
        CalculationConfig::Relax(cfg) => batch.execute(&RelaxationEngine::new(cfg), write_relax),
        CalculationConfig::Surface(cfg) => batch.execute(&SurfaceEnergyEngine::new(cfg), write_surface),
        CalculationConfig::Phonon(cfg) => batch.execute(&PhononEngine::new(cfg), write_phonon),
        CalculationConfig::Elastic(cfg) => batch.execute(&ElasticityEngine::new(cfg), write_elastic),
    }
}

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

// --- Main ---

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Run { job, output, jobs } => {
            let mut config = JobConfig::load(&job)
                .with_context(|| format!("Failed to load job file '{}'", job.display()))?;
            if let Some(dir) = output {
                config.output_dir = dir;
            }
            if let Some(n) = jobs {
                config.jobs = n;
            }
            let batch = Batch {
                structures: config.load_structures().context("Failed to read job structures")?,
                potential: config.potential.clone(),
                parallelism: config.parallelism(),
                output_dir: config.output_dir.clone(),
            };
            info!("Job '{}': {} calculation", job.display(), config.calculation.name());
            run_calculation(&batch, config.calculation)
        }
        Command::Relax {
            common,
            fixed_cell,
            fmax,
            max_steps,
        } => {
            let cfg = RelaxConfig {
                relax_cell: !fixed_cell,
                fmax,
                max_steps,
                ..RelaxConfig::default()
            };
            run_calculation(&Batch::from_common(&common)?, CalculationConfig::Relax(cfg))
        }
        Command::Surface {
            common,
            miller,
            slab,
            vacuum,
        } => {
            let cfg = SurfaceConfig {
                miller,
                min_slab_size: slab,
                min_vacuum_size: vacuum,
                ..SurfaceConfig::default()
            };
            run_calculation(&Batch::from_common(&common)?, CalculationConfig::Surface(cfg))
        }
        Command::Phonon {
            common,
            supercell,
            displacement,
        } => {
            let [a, b, c] = supercell;
            let cfg = PhononConfig {
                supercell_matrix: [[a, 0, 0], [0, b, 0], [0, 0, c]],
                displacement,
                ..PhononConfig::default()
            };
            run_calculation(&Batch::from_common(&common)?, CalculationConfig::Phonon(cfg))
        }
        Command::Elastic { common } => run_calculation(
            &Batch::from_common(&common)?,
            CalculationConfig::Elastic(ElasticConfig::default()),
        ),
        Command::Potentials => {
            for (name, aliases) in registry::available() {
                if aliases.is_empty() {
                    println!("{}", name);
                } else {
                    println!("{:<10} (aliases: {})", name, aliases.join(", "));
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miller_indices_parse_in_common_notations() {
        assert_eq!(parse_miller("111").unwrap(), [1, 1, 1]);
        assert_eq!(parse_miller("1-10").unwrap(), [1, -1, 0]);
        assert_eq!(parse_miller("(1, 1, 0)").unwrap(), [1, 1, 0]);
        assert_eq!(parse_miller("10 -3 2").unwrap(), [10, -3, 2]);
        assert!(parse_miller("000").is_err());
        assert!(parse_miller("11").is_err());
    }

    #[test]
    fn supercells_must_be_positive() {
        assert_eq!(parse_supercell("2x2x2").unwrap(), [2, 2, 2]);
        assert_eq!(parse_supercell("3,3,2").unwrap(), [3, 3, 2]);
        assert!(parse_supercell("2x0x2").is_err());
    }
}
