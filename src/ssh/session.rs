mod metrics;
mod state;

use std::{net::SocketAddr, sync::Arc};

use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use metrics::{
    ACTIVE_SESSIONS, AUTH_ATTEMPTS, AUTH_RESULTS, CHANNELS, REQUESTS, SESSION_DURATION,
    TOTAL_SESSIONS, UNEXPECTED_STATE,
};
use russh::{
    keys::key::PublicKey,
    server::{self, Auth, Handle, Msg},
    ChannelId, CryptoVec,
};
use state::State;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    bridge,
    ssh::{Caller, Controller},
    store::Status,
    target::{Target, Verb},
};

/// Upper bound on an exec payload.
const MAX_PAYLOAD: usize = 512;

/// Written to callers that ask for a shell on the bastion itself.
static BAD_REQUEST_SHELL: &str = "--- open-bastion ---\n\r\
    \n\r\
    [!] error\n\r\
    [!]\n\r\
    [!] your SSH request went through the bastion without target.\n\r\
    [!] to access a server simply run:\n\r\
    [!]\n\r\
    [!]     ssh BASTION_IP -- SERVER_IP\n\r\
    [!]\n\r\
    [!] this incident has been logged\n\r";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad request type (shell)")]
    BadRequestType,
    #[error("backend command longer than allowed (> {MAX_PAYLOAD}B)")]
    PayloadTooLong,
    #[error("{0} is not implemented")]
    Unimplemented(Verb),
}

pub struct Session {
    controller: Arc<Controller>,
    peer: Option<SocketAddr>,
    start: DateTime<Utc>,
    state: State,
    tasks: JoinSet<Result<()>>,
}

impl Session {
    pub(super) fn new(controller: Arc<Controller>, peer: Option<SocketAddr>) -> Self {
        Self {
            controller,
            peer,
            start: Utc::now(),
            state: State::default(),
            tasks: JoinSet::new(),
        }
    }

    fn reply(session: &mut server::Session, id: ChannelId, message: &str) {
        session.data(id, CryptoVec::from_slice(message.as_bytes()));
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
    }
}

fn payload_guard(data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLong);
    }

    Ok(())
}

#[async_trait::async_trait]
impl server::Handler for Session {
    type Error = eyre::Error;

    #[tracing::instrument(skip(self, key))]
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth> {
        AUTH_ATTEMPTS.publickey.inc();
        debug!("publickey");

        let caller = Caller {
            login: user.to_string(),
            peer: self.peer,
            fingerprint: key.fingerprint(),
        };

        match self.controller.store().status(user) {
            Ok(Status::Active) => {}
            Ok(Status::Inactive) => {
                AUTH_RESULTS.publickey.reject.inc();
                info!(%caller, "account deactivated");

                return Ok(reject());
            }
            Ok(Status::Invalid) => {
                AUTH_RESULTS.publickey.reject.inc();
                info!(%caller, "invalid user");

                return Ok(reject());
            }
            Err(error) => {
                AUTH_RESULTS.publickey.reject.inc();
                warn!(%caller, %error, "identity lookup failed");

                return Ok(reject());
            }
        }

        if !self.controller.auth().contains(key) {
            AUTH_RESULTS.publickey.reject.inc();
            info!(%caller, "unknown public key");

            return Ok(reject());
        }

        AUTH_RESULTS.publickey.accept.inc();
        debug!(%caller, fingerprint = %caller.fingerprint, "authenticated");

        self.state.authenticated(caller);

        Ok(Auth::Accept)
    }

    #[tracing::instrument(skip(self, channel, _session))]
    async fn channel_open_session(
        &mut self,
        channel: russh::Channel<Msg>,
        _session: &mut server::Session,
    ) -> Result<bool> {
        CHANNELS.open_session.inc();
        debug!("open-session");

        // One session channel per connection; everything else is refused.
        if !matches!(self.state, State::Authenticated(_)) {
            return Ok(false);
        }

        TOTAL_SESSIONS.inc();
        ACTIVE_SESSIONS.inc();

        self.state.sessioned(channel);

        Ok(true)
    }

    #[tracing::instrument(skip(self, data, session))]
    async fn exec_request(
        &mut self,
        id: ChannelId,
        data: &[u8],
        session: &mut server::Session,
    ) -> Result<()> {
        REQUESTS.exec.inc();
        debug!(len = data.len(), "exec");

        if !matches!(self.state, State::Sessioned(..)) {
            // The first captured exec wins; later requests are dropped
            // without a reply.
            return Ok(());
        }

        if let Err(error) = payload_guard(data) {
            Self::reply(
                session,
                id,
                &format!("Your backend command is longer than allowed (> {MAX_PAYLOAD}B)\n"),
            );

            return Err(error.into());
        }

        let target = match Target::parse(data) {
            Ok(target) => target,
            Err(error) => {
                Self::reply(session, id, &format!("Unable to parse target : {error}\n"));

                return Err(error.into());
            }
        };

        if target.command != Verb::Ssh {
            Self::reply(
                session,
                id,
                &format!("Error : {} is not implemented\n", target.command),
            );

            return Err(ProtocolError::Unimplemented(target.command).into());
        }

        let Ok((channel, caller)) = self.state.take_sessioned() else {
            UNEXPECTED_STATE
                .with_label_values(&["Sessioned", self.state.as_ref()])
                .inc();

            return Err(eyre!("unexpected state: {:?}", self.state));
        };

        // No user in the target means the caller's own login; the login
        // was already validated during the handshake.
        let user = target
            .user
            .clone()
            .unwrap_or_else(|| caller.login.clone());

        info!(%caller, %target, %user, "dispatching");

        session.channel_success(id);

        self.tasks.spawn(supervise(
            self.controller.clone(),
            caller,
            target,
            user,
            channel,
            session.handle(),
        ));

        Ok(())
    }

    #[tracing::instrument(skip(self, session))]
    async fn shell_request(&mut self, id: ChannelId, session: &mut server::Session) -> Result<()> {
        REQUESTS.shell.inc();
        debug!("shell");

        // A bastion never hands out its own shell.
        Self::reply(session, id, BAD_REQUEST_SHELL);

        Err(ProtocolError::BadRequestType.into())
    }

    #[tracing::instrument(skip(self, _session))]
    async fn channel_eof(&mut self, _id: ChannelId, _session: &mut server::Session) -> Result<()> {
        CHANNELS.eof.inc();
        debug!("channel-eof");

        Ok(())
    }

    #[tracing::instrument(skip(self, _session))]
    async fn channel_close(&mut self, _id: ChannelId, _session: &mut server::Session) -> Result<()> {
        CHANNELS.close.inc();
        debug!("channel-close");

        Ok(())
    }
}

/// Owns one commanded session from dial to teardown. Every exit path
/// releases the egress side, reports the failure to the caller, and
/// closes the ingress channel exactly once.
async fn supervise(
    controller: Arc<Controller>,
    caller: Caller,
    target: Target,
    user: String,
    channel: russh::Channel<Msg>,
    handle: Handle,
) -> Result<()> {
    let id = channel.id();

    let result = run(&controller, &caller, &target, &user, channel).await;

    if let Err(error) = &result {
        info!(%caller, %error, "session failed");

        let line = format!("Error : {error}\n");
        let _ = handle.data(id, CryptoVec::from_slice(line.as_bytes())).await;
    }

    let _ = handle.close(id).await;

    result
}

async fn run(
    controller: &Controller,
    caller: &Caller,
    target: &Target,
    user: &str,
    channel: russh::Channel<Msg>,
) -> Result<()> {
    // Read fresh for every session, never cached.
    let signer = controller.store().egress_signer(&caller.login)?;

    let backend = controller.dialer().dial(target, user, Some(signer)).await?;

    let (stdio, status) = backend.stdio();

    let (sent, received) = bridge::join(channel.into_stream(), stdio, None).await;

    debug!(%caller, sent, received, "bridge closed");

    match status.await {
        Ok(Some(code)) => info!(%caller, code, "backend exited"),
        Ok(None) | Err(_) => debug!(%caller, "backend closed without exit status"),
    }

    Ok(())
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(self.state, State::Sessioned(..) | State::Commanded(_)) {
            ACTIVE_SESSIONS.dec();

            SESSION_DURATION.observe(
                (Utc::now() - self.start)
                    .to_std()
                    .expect("duration in range")
                    .as_secs_f64()
                    / 60.0,
            );
        }

        self.tasks.abort_all();
    }
}
