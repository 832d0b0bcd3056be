// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxihome::{
    apply::{apply, ApplyOptions},
    config::Config,
    crypt::NoDecryption,
    path::{default_config_file, dest_relative, normalize},
    runstate::FileRunState,
    source::SourceTree,
    system::RealSystem,
    target::{BuildOptions, TargetState},
    template::MiniJinja,
};

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::{env::current_dir, path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxihome [options] <oxihome-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "file")]
    pub config: Option<PathBuf>,

    /// Path to source directory.
    #[arg(short = 'S', long, global = true, value_name = "dir")]
    pub source: Option<PathBuf>,

    /// Path to destination directory.
    #[arg(short = 'D', long, global = true, value_name = "dir")]
    pub destination: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Apply(opts) => run_apply(config, opts),
        }
    }

    fn load_config(&self) -> Result<Config> {
        let cwd = current_dir()?;
        let path = match &self.config {
            Some(path) => path.clone(),
            None => default_config_file()?,
        };

        let mut config = Config::load(path)?;
        if let Some(source) = &self.source {
            config.source_dir = Some(normalize(cwd.join(source)));
        }
        if let Some(destination) = &self.destination {
            config.dest_dir = Some(normalize(cwd.join(destination)));
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Update destination directory to match source directory.
    #[command(override_usage = "oxihome apply [options] [<path>]...")]
    Apply(ApplyArgs),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ApplyArgs {
    /// Targets to apply, everything if none are given.
    #[arg(value_name = "path")]
    pub paths: Vec<PathBuf>,

    /// Show what would change without changing anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Include everything beneath targeted directories.
    #[arg(
        short,
        long,
        value_name = "bool",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub recursive: bool,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = Cli::parse().run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run_apply(config: Config, opts: ApplyArgs) -> Result<()> {
    let cwd = current_dir()?;
    let source_dir = normalize(cwd.join(config.source_dir()?));
    let dest_dir = normalize(cwd.join(config.dest_dir()?));

    let scope = opts
        .paths
        .iter()
        .map(|path| {
            dest_relative(&dest_dir, &cwd, path).ok_or_else(|| {
                anyhow!(
                    "{:?} is not inside destination directory {:?}",
                    path.display(),
                    dest_dir.display()
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let tree = SourceTree::walk(&source_dir)?;
    let data = config.data_context()?;
    let build_options = BuildOptions::new(&dest_dir)
        .with_scope(scope)
        .with_recursive(opts.recursive);
    let engine = MiniJinja::new();
    let state = match config.decryptor() {
        Some(decryptor) => TargetState::build(&tree, &data, &engine, &decryptor, &build_options)?,
        None => TargetState::build(&tree, &data, &engine, &NoDecryption, &build_options)?,
    };

    let mut run_state = FileRunState::open(config.state_file()?)?;
    let apply_options = ApplyOptions {
        dry_run: opts.dry_run,
        umask: config.umask(),
    };
    let report = apply(&state, &RealSystem::new(), &mut run_state, &apply_options)?;

    match (report.is_empty(), opts.dry_run) {
        (true, _) => info!("{:?} is up to date", dest_dir.display()),
        (false, true) => info!("{} change(s) planned", report.len()),
        (false, false) => info!("{} change(s) applied", report.len()),
    }

    Ok(())
}
