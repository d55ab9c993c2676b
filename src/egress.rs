use std::{sync::Arc, time::Duration};

use russh::{client, ChannelMsg, Disconnect, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{bridge, target::Target};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

const TERM: &str = "xterm";
const TERM_COLS: u32 = 80;
const TERM_ROWS: u32 = 40;
const TERM_SPEED: u32 = 14400;

/// What the dialer does with a backend host key. Verifying against a
/// known-hosts store is the hook this leaves open; hardened deployments
/// set `reject-unknown` until one exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Accept whatever the backend presents. Assumes backends are
    /// provisioned alongside the bastion; every acceptance is logged.
    #[default]
    InsecureAcceptAll,
    RejectUnknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("error dialing backend : {0}")]
    Dial(#[source] russh::Error),
    #[error("error dialing backend : timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("backend rejected credentials for {0}")]
    Auth(String),
    #[error("error creating new session : {0}")]
    Session(#[source] russh::Error),
    #[error("error requesting pseudo terminal : {0}")]
    Pty(#[source] russh::Error),
    #[error("error starting shell : {0}")]
    Shell(#[source] russh::Error),
}

#[derive(Clone, Debug)]
pub struct Options {
    pub timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

pub struct Dialer {
    options: Options,
}

struct Client {
    policy: HostKeyPolicy,
    host: String,
}

#[async_trait::async_trait]
impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::InsecureAcceptAll => {
                warn!(host = %self.host, "accepting backend host key without verification");

                Ok(true)
            }
            HostKeyPolicy::RejectUnknown => {
                warn!(host = %self.host, "rejecting unknown backend host key");

                Ok(false)
            }
        }
    }
}

impl Dialer {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// Connects to the target, authenticates as `user` and starts an
    /// interactive shell on a fresh PTY. The empty password goes first,
    /// kept for backends that accept trivial passwords, then the caller's
    /// stored key.
    pub async fn dial(
        &self,
        target: &Target,
        user: &str,
        signer: Option<KeyPair>,
    ) -> Result<Backend, Error> {
        let config = Arc::new(client::Config::default());

        let handler = Client {
            policy: self.options.host_key_policy,
            host: target.host.clone(),
        };

        let mut handle = timeout(
            self.options.timeout,
            client::connect(config, target.addr(), handler),
        )
        .await
        .map_err(|_| Error::DialTimeout(self.options.timeout))?
        .map_err(Error::Dial)?;

        let mut authenticated = handle
            .authenticate_password(user, "")
            .await
            .unwrap_or(false);

        if !authenticated {
            if let Some(signer) = signer {
                authenticated = handle
                    .authenticate_publickey(user, Arc::new(signer))
                    .await
                    .map_err(Error::Dial)?;
            }
        }

        if !authenticated {
            return Err(Error::Auth(user.to_string()));
        }

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(Error::Session)?;

        channel
            .request_pty(
                false,
                TERM,
                TERM_COLS,
                TERM_ROWS,
                0,
                0,
                &[
                    (Pty::TTY_OP_ISPEED, TERM_SPEED),
                    (Pty::TTY_OP_OSPEED, TERM_SPEED),
                ],
            )
            .await
            .map_err(Error::Pty)?;

        channel.request_shell(false).await.map_err(Error::Shell)?;

        debug!(host = %target.host, port = target.port, user, "shell started");

        Ok(Backend { handle, channel })
    }
}

/// A running shell on the backend.
pub struct Backend {
    handle: client::Handle<Client>,
    channel: russh::Channel<client::Msg>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

impl Backend {
    /// Splits the session into its stdio pipe, fit for one side of the
    /// bridge, and a receiver that resolves with the remote exit status
    /// once the session ends. A remote exit, with or without a status, is
    /// an expected outcome, not an error.
    pub fn stdio(self) -> (DuplexStream, oneshot::Receiver<Option<u32>>) {
        let (local, remote) = tokio::io::duplex(bridge::BUFFER_SIZE);
        let (status_tx, status_rx) = oneshot::channel();

        tokio::spawn(pump(self.handle, self.channel, remote, status_tx));

        (local, status_rx)
    }
}

/// Drives the backend channel: stdio writes become channel data, channel
/// data becomes stdio reads, EOF travels in both directions, and the exit
/// status is kept for the supervisor.
async fn pump(
    mut handle: client::Handle<Client>,
    mut channel: russh::Channel<client::Msg>,
    mut stdio: DuplexStream,
    status: oneshot::Sender<Option<u32>>,
) {
    let mut exit = None;
    let mut open = true;
    let mut buf = vec![0u8; bridge::BUFFER_SIZE];

    loop {
        tokio::select! {
            read = stdio.read(&mut buf), if open => match read {
                Ok(0) | Err(_) => {
                    open = false;
                    let _ = channel.eof().await;
                }
                Ok(read) => {
                    if channel.data(&buf[..read]).await.is_err() {
                        break;
                    }
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                    if stdio.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit = Some(exit_status),
                Some(ChannelMsg::Eof) => {
                    let _ = stdio.shutdown().await;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "session ended", "")
        .await;

    let _ = status.send(exit);
}
