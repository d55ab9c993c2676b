mod serve;
mod users;

use std::{path::PathBuf, sync::Mutex};

use cata::{Command, Container};
use clap::{Parser, Subcommand};
use clio::Output;
use eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

use crate::config::{Config, LogConfig};

static DEFAULT_CONFIG_FILE: &str = "/etc/open-bastion/open-bastion.json";

#[derive(Parser, Container)]
pub struct Root {
    #[command(subcommand)]
    command: RootCmd,

    /// Configuration file path
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config_file: PathBuf,
}

#[derive(Subcommand, Container)]
enum RootCmd {
    Serve(serve::Serve),
    Users(users::Users),
}

impl Command for Root {
    fn pre_run(&self) -> Result<()> {
        let config = Config::load(&self.config_file)?;

        init_tracing(&config.log)
    }
}

fn init_tracing(config: &LogConfig) -> Result<()> {
    // russh logs through `log`.
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::builder()
        .with_default_directive(config.level_filter().into())
        .from_env_lossy();

    let sink = if config.path.is_empty() {
        Output::std_err()
    } else {
        Output::new(config.path.as_str())?
    };

    let registry = tracing_subscriber::registry().with(ErrorLayer::default());

    if config.is_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(config.report_caller)
                    .with_line_number(config.report_caller)
                    .with_writer(Mutex::new(sink))
                    .with_filter(filter),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(config.report_caller)
                    .with_line_number(config.report_caller)
                    .with_writer(Mutex::new(sink))
                    .with_filter(filter),
            )
            .init();
    }

    Ok(())
}
