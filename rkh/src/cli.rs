use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use libhealer::config::{Config, load_config};

#[derive(Parser)]
#[command(name = "rkh", version, about = "RKS worker healer daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the healer with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
        /// Override the desired number of workers
        #[arg(long)]
        workers: Option<u32>,
        /// Override the worker program
        #[arg(long)]
        program: Option<PathBuf>,
    },
    /// Keep WORKERS instances of PROGRAM registered, with default settings
    Run {
        workers: u32,
        program: PathBuf,
        /// Xline endpoint, may be repeated
        #[arg(short, long = "endpoint")]
        endpoints: Vec<String>,
        #[arg(long)]
        namespace: Option<String>,
        /// Command placed before the program's file name, e.g. "java -jar"
        #[arg(long, value_delimiter = ' ')]
        launch_prefix: Vec<String>,
    },
}

impl Commands {
    pub fn into_config(self) -> Result<Config> {
        let cfg = match self {
            Commands::Start {
                config,
                workers,
                program,
            } => {
                let mut cfg = load_config(&config.to_string_lossy())?;
                if let Some(workers) = workers {
                    cfg.workers = workers;
                }
                if let Some(program) = program {
                    cfg.program = program;
                }
                cfg
            }
            Commands::Run {
                workers,
                program,
                endpoints,
                namespace,
                launch_prefix,
            } => {
                let mut cfg = Config::new(workers, program);
                if !endpoints.is_empty() {
                    cfg.xline_config.endpoints = endpoints;
                }
                if let Some(namespace) = namespace {
                    cfg.namespace = namespace;
                }
                cfg.launch_prefix = launch_prefix.into_iter().filter(|s| !s.is_empty()).collect();
                cfg
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
