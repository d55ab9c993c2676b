use std::{path::PathBuf, time::Duration};

use cata::{Command, Container};
use clap::Parser;
use eyre::Result;
use russh::MethodSet;
use russh_keys::load_secret_key;
use tracing::{info, warn};

use crate::{
    auth::AuthorizedKeys,
    config::Config,
    egress,
    ssh::{Bastion, ControllerBuilder},
    store::Store,
};

/// Accept operator sessions and proxy them to their backends.
#[derive(Parser, Container)]
pub struct Serve {
    #[clap(from_global)]
    config_file: PathBuf,
}

#[async_trait::async_trait]
impl Command for Serve {
    #[allow(clippy::blocks_in_conditions)]
    #[tracing::instrument(err, skip(self), fields(activity = "serve"))]
    async fn run(&self) -> Result<()> {
        let config = Config::load(&self.config_file)?;

        let auth = AuthorizedKeys::load(&config.authorized_keys_file)?;

        if auth.is_empty() {
            warn!("authorized keys file holds no keys, every key login will fail");
        }

        let store = Store::new(&config)?;

        let host_key = load_secret_key(&config.private_key_file, None)?;

        let controller = ControllerBuilder::default()
            .auth(auth)
            .store(store)
            .egress(egress::Options {
                timeout: Duration::from_secs(config.dial_timeout),
                host_key_policy: config.host_key_policy,
            })
            .build()?;

        let methods = if config.permit_key_login {
            MethodSet::PUBLICKEY
        } else {
            MethodSet::empty()
        };

        let server = russh::server::Config {
            methods,
            keys: vec![host_key],
            max_auth_attempts: 3,
            auth_rejection_time: Duration::from_millis(100),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };

        info!(
            address = %config.listen_address,
            port = config.listen_port,
            "listening"
        );

        Bastion::new(controller)
            .run(server, (config.listen_address.clone(), config.listen_port))
            .await
    }
}
