use std::path::{Path, PathBuf};

use cata::{Command, Container};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use serde::Serialize;

use crate::{config::Config, store::Store};

#[derive(Parser, Container)]
pub struct Users {
    #[command(subcommand)]
    command: UsersCmd,
}

#[derive(Subcommand, Container)]
enum UsersCmd {
    Add(Add),
    Delete(Delete),
    Status(Status),
}

impl Command for Users {}

fn store(config_file: &Path) -> Result<Store> {
    Ok(Store::new(&Config::load(config_file)?)?)
}

#[derive(Serialize)]
struct AddOutput {
    user: String,
    public_key: String,
}

/// Create a user with a fresh egress key pair.
#[derive(Parser, Container)]
pub struct Add {
    name: String,

    /// Egress key type. Only ed25519 is generated.
    #[arg(long, default_value = "ed25519")]
    key_type: String,

    #[clap(from_global)]
    config_file: PathBuf,
}

#[async_trait::async_trait]
impl Command for Add {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "users.add"))]
    async fn run(&self) -> Result<()> {
        if self.key_type != "ed25519" {
            return Err(eyre!("unknown key type: {}", self.key_type));
        }

        let public_key = store(&self.config_file)?.add_user(&self.name)?;

        println!(
            "{}",
            serde_json::to_string_pretty(&AddOutput {
                user: self.name.clone(),
                public_key,
            })?
        );

        Ok(())
    }
}

/// Remove a user and every key associated with them.
#[derive(Parser, Container)]
pub struct Delete {
    name: String,

    #[clap(from_global)]
    config_file: PathBuf,
}

#[async_trait::async_trait]
impl Command for Delete {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "users.delete"))]
    async fn run(&self) -> Result<()> {
        store(&self.config_file)?.delete_user(&self.name)?;

        println!("{} deleted", self.name);

        Ok(())
    }
}

/// Show whether a user can log in.
#[derive(Parser, Container)]
pub struct Status {
    name: String,

    #[clap(from_global)]
    config_file: PathBuf,
}

#[async_trait::async_trait]
impl Command for Status {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "users.status"))]
    async fn run(&self) -> Result<()> {
        let status = store(&self.config_file)?.status(&self.name)?;

        println!("{status}");

        Ok(())
    }
}
