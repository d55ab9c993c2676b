mod session;

use std::{fmt, net::SocketAddr, sync::Arc};

use derive_builder::Builder;
use eyre::Result;
use russh::server::{Config, Handler, Server};
use session::Session;
use tracing::error;

use crate::{auth::AuthorizedKeys, egress, store::Store};

/// Everything a session needs to authenticate a caller and reach a
/// backend. Read-only once the listener is up.
#[derive(Builder)]
pub struct Controller {
    auth: AuthorizedKeys,
    store: Store,
    egress: egress::Options,
}

impl Controller {
    pub fn auth(&self) -> &AuthorizedKeys {
        &self.auth
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn dialer(&self) -> egress::Dialer {
        egress::Dialer::new(self.egress.clone())
    }
}

/// The authenticated inbound identity, fixed at handshake time.
#[derive(Clone, Debug)]
pub struct Caller {
    pub login: String,
    pub peer: Option<SocketAddr>,
    pub fingerprint: String,
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "{}@{peer}", self.login),
            None => write!(f, "{}", self.login),
        }
    }
}

#[derive(Clone)]
pub struct Bastion {
    controller: Arc<Controller>,
}

impl Bastion {
    pub fn new(controller: Controller) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    pub async fn run(&mut self, cfg: Config, addr: (String, u16)) -> Result<()> {
        self.run_on_address(Arc::new(cfg), addr).await?;

        Ok(())
    }
}

impl Server for Bastion {
    type Handler = Session;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        Session::new(self.controller.clone(), peer)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        if let Some(russh::Error::IO(_)) = error.downcast_ref::<russh::Error>() {
            return;
        }

        error!("session ended with error: {:#?}", error);
    }
}
