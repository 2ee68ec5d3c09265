#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::ArrayView2;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;

use nbglm::data::{load_design, load_table, load_vector};
use nbglm::estimate::FitResult;
use nbglm::progress::FitProgressObserver;
use nbglm::session::CheckpointSink;
use nbglm::{
    DesignMatrix, Family, FitConfig, FitData, FitHooks, FitSnapshot, StopReason, Strategy,
    fit_glm_with,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum FamilyCli {
    /// Negative binomial counts with log links on mean and dispersion.
    Nb,
    /// Normal responses with a log link on the standard deviation.
    Normal,
}

impl From<FamilyCli> for Family {
    fn from(family: FamilyCli) -> Self {
        match family {
            FamilyCli::Nb => Family::NegativeBinomial,
            FamilyCli::Normal => Family::normal(),
        }
    }
}

#[derive(Args)]
pub struct FitArgs {
    /// TSV of observations × features; the header names the features and the
    /// first column holds observation ids
    #[arg(long, value_name = "PATH")]
    pub counts: PathBuf,

    /// TSV design matrix for the location model
    #[arg(long, value_name = "PATH")]
    pub design_loc: PathBuf,

    /// TSV design matrix for the scale model (intercept only if omitted)
    #[arg(long, value_name = "PATH")]
    pub design_scale: Option<PathBuf>,

    /// TSV with one size factor per observation, applied as a log offset
    #[arg(long, value_name = "PATH")]
    pub size_factors: Option<PathBuf>,

    /// TSV of location constraints, one row per constraint, one column per parameter
    #[arg(long, value_name = "PATH")]
    pub constraints_loc: Option<PathBuf>,

    /// TSV of scale constraints, one row per constraint, one column per parameter
    #[arg(long, value_name = "PATH")]
    pub constraints_scale: Option<PathBuf>,

    /// TOML fit configuration; command-line options override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Optimizer name, e.g. nr_tr, irls, adam
    #[arg(long)]
    pub optimizer: Option<String>,

    #[arg(long, value_enum)]
    pub family: Option<FamilyCli>,

    #[arg(long, value_name = "N")]
    pub max_steps: Option<usize>,

    /// Write a checkpoint of the coefficients every N steps
    #[arg(long, value_name = "N")]
    pub checkpoint_every: Option<usize>,

    /// Threads writing checkpoints
    #[arg(long, value_name = "N")]
    pub checkpoint_workers: Option<usize>,

    /// Output directory
    #[arg(long, default_value = "nbglm_out")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(name = "nbglm", version, about = "Batched constrained GLM fitting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit one GLM per feature column
    Fit(FitArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        Some(Commands::Fit(args)) => run_fit(args),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(args: &FitArgs) -> Result<FitConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => FitConfig::load(path)?,
        None => FitConfig {
            checkpoint_workers: num_cpus::get().clamp(1, 4),
            ..FitConfig::default()
        },
    };
    if let Some(name) = &args.optimizer {
        config.optimizer = name.parse::<Strategy>()?;
    }
    if let Some(family) = args.family {
        config.family = family.into();
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if args.checkpoint_every.is_some() {
        config.checkpoint_every = args.checkpoint_every;
    }
    if let Some(workers) = args.checkpoint_workers {
        config.checkpoint_workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn load_fit_data(args: &FitArgs) -> Result<FitData, Box<dyn std::error::Error>> {
    println!("Loading counts from: {}", args.counts.display());
    let counts = load_table(&args.counts)?;
    let n_obs = counts.values.nrows();

    let design_loc = load_design(&args.design_loc)?;
    let design_scale = match &args.design_scale {
        Some(path) => load_design(path)?,
        None => DesignMatrix::intercept(n_obs),
    };

    let mut data = FitData::new(counts.values, design_loc, design_scale)?
        .with_feature_names(counts.column_names)?;
    if let Some(path) = &args.size_factors {
        data = data.with_size_factors(load_vector(path)?.view())?;
    }
    if let Some(path) = &args.constraints_loc {
        data = data.with_constraints_loc(load_table(path)?.values);
    }
    if let Some(path) = &args.constraints_scale {
        data = data.with_constraints_scale(load_table(path)?.values);
    }
    println!(
        "Loaded {} observations of {} features ({} location, {} scale coefficients)",
        data.n_observations(),
        data.n_features(),
        data.design_loc.ncols(),
        data.design_scale.ncols()
    );
    Ok(data)
}

pub fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let data = load_fit_data(&args)?;
    fs::create_dir_all(&args.out)?;

    let checkpoints = match config.checkpoint_every {
        Some(_) => {
            let dir = args.out.join("checkpoints");
            fs::create_dir_all(&dir)?;
            Some(TsvCheckpointWriter {
                dir,
                feature_names: data.feature_names.clone(),
                loc_names: data.design_loc.column_names().to_vec(),
                scale_names: data.design_scale.column_names().to_vec(),
            })
        }
        None => None,
    };

    let mut progress = ProgressBarObserver::default();
    let hooks = FitHooks {
        progress: Some(&mut progress),
        checkpoint: checkpoints.as_ref().map(|w| w as &dyn CheckpointSink),
        ..FitHooks::default()
    };
    let result = fit_glm_with(&data, &config, hooks)?;

    write_outputs(&args.out, &result)?;
    println!(
        "{} of {} features converged after {} steps ({}). Results written to {}",
        result.n_converged(),
        result.converged.len(),
        result.iterations,
        result.stop_reason,
        args.out.display()
    );
    Ok(())
}

fn write_outputs(out: &Path, result: &FitResult) -> csv::Result<()> {
    write_coefficients(
        &out.join("location.tsv"),
        &result.feature_names,
        &result.loc_names,
        result.a.view(),
    )?;
    write_coefficients(
        &out.join("scale.tsv"),
        &result.feature_names,
        &result.scale_names,
        result.b.view(),
    )?;

    let mut writer = tsv_writer(&out.join("summary.tsv"))?;
    let mut header = vec!["feature", "converged", "log_likelihood"];
    if result.trust_region_radius.is_some() {
        header.push("trust_region_radius");
    }
    writer.write_record(&header)?;
    for (j, name) in result.feature_names.iter().enumerate() {
        let mut record = vec![
            name.clone(),
            result.converged[j].to_string(),
            result.log_likelihood[j].to_string(),
        ];
        if let Some(radius) = &result.trust_region_radius {
            record.push(radius[j].to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn tsv_writer(path: &Path) -> csv::Result<csv::Writer<fs::File>> {
    csv::WriterBuilder::new().delimiter(b'\t').from_path(path)
}

/// Writes parameters × features coefficients as one row per feature.
fn write_coefficients(
    path: &Path,
    feature_names: &[String],
    coef_names: &[String],
    coefficients: ArrayView2<f64>,
) -> csv::Result<()> {
    let mut writer = tsv_writer(path)?;
    let header = std::iter::once("feature").chain(coef_names.iter().map(String::as_str));
    writer.write_record(header)?;
    for (name, column) in feature_names.iter().zip(coefficients.columns()) {
        let record = std::iter::once(name.clone()).chain(column.iter().map(|v| v.to_string()));
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

struct TsvCheckpointWriter {
    dir: PathBuf,
    feature_names: Vec<String>,
    loc_names: Vec<String>,
    scale_names: Vec<String>,
}

impl CheckpointSink for TsvCheckpointWriter {
    fn write_checkpoint(&self, snapshot: &FitSnapshot) -> io::Result<()> {
        let step = snapshot.step;
        write_coefficients(
            &self.dir.join(format!("step{step:06}_location.tsv")),
            &self.feature_names,
            &self.loc_names,
            snapshot.a.view(),
        )?;
        write_coefficients(
            &self.dir.join(format!("step{step:06}_scale.tsv")),
            &self.feature_names,
            &self.scale_names,
            snapshot.b.view(),
        )?;
        log::debug!("Checkpoint for step {step} written (loss {:.6e}).", snapshot.loss);
        Ok(())
    }
}

#[derive(Default)]
struct ProgressBarObserver {
    bar: Option<ProgressBar>,
    n_features: usize,
}

impl FitProgressObserver for ProgressBarObserver {
    fn on_fit_start(&mut self, n_features: usize, max_steps: usize) {
        let draw_target = if io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(max_steps as u64), draw_target);
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        self.n_features = n_features;
        self.bar = Some(bar);
    }

    fn on_iteration(&mut self, step: usize, loss: f64, n_converged: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(step as u64);
            bar.set_message(format!(
                "loss {loss:.6e}, {n_converged}/{} converged",
                self.n_features
            ));
        }
    }

    fn on_fit_finish(&mut self, reason: &StopReason) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("stopped: {reason}"));
        }
    }
}
