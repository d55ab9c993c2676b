use eyre::{eyre, Result};
use replace_with::{replace_with_or_abort, replace_with_or_abort_and_return};
use russh::server;

use crate::ssh::Caller;

#[derive(Debug, Default, strum_macros::AsRefStr)]
pub enum State {
    // Used when all the fields of a variant have been moved out and the
    // next state is pending.
    Unknown,
    #[default]
    Unauthenticated,
    Authenticated(Caller),
    Sessioned(russh::Channel<server::Msg>, Caller),
    Commanded(Caller),
}

impl State {
    pub fn authenticated(&mut self, caller: Caller) {
        *self = State::Authenticated(caller);
    }

    pub fn sessioned(&mut self, channel: russh::Channel<server::Msg>) {
        replace_with_or_abort(self, |self_| match self_ {
            State::Authenticated(caller) => State::Sessioned(channel, caller),
            other => other,
        });
    }

    pub fn take_sessioned(&mut self) -> Result<(russh::Channel<server::Msg>, Caller)> {
        replace_with_or_abort_and_return(self, |self_| match self_ {
            State::Sessioned(channel, caller) => {
                let next = State::Commanded(caller.clone());

                (Ok((channel, caller)), next)
            }
            other => (Err(eyre!("no session channel")), other),
        })
    }
}
