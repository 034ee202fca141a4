//! PAP authenticator - RFC 1334.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::ppp::{protocols, PppPacket};
use crate::error::Error;
use crate::mailbox::PppMailbox;
use crate::message::{ControlMessage, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

use super::ZERO_HLAK_LEN;

/// PAP frame codes.
mod codes {
    pub const AUTHENTICATE_REQUEST: u8 = 1;
    pub const AUTHENTICATE_ACK: u8 = 2;
    pub const AUTHENTICATE_NAK: u8 = 3;
}

/// The PAP authentication task.
pub struct PapAuthenticator {
    mailbox: PppMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl PapAuthenticator {
    pub fn new(
        mailbox: PppMailbox,
        sink: TunnelSink,
        session: Arc<Session>,
        control: mpsc::Sender<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mailbox,
            sink,
            session,
            control,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let budget = Duration::from_secs(self.session.config.ppp.auth_timeout);
        let cancel = self.cancel.clone();

        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(budget, self.authenticate()) => match result {
                Ok(Ok(())) => ControlMessage::proceeded(Where::Pap),
                Ok(Err(error)) => ControlMessage::failed(Where::Pap, error),
                Err(_) => ControlMessage::failed(Where::Pap, Error::Timeout),
            },
        };
        let _ = self.control.send(message).await;
    }

    async fn authenticate(&mut self) -> Result<(), Error> {
        let config = &self.session.config;
        let id = self.session.next_frame_id();

        let user = config.username.as_bytes();
        let pass = config.password.as_bytes();
        let mut payload = Vec::with_capacity(2 + user.len() + pass.len());
        payload.push(user.len() as u8);
        payload.extend_from_slice(user);
        payload.push(pass.len() as u8);
        payload.extend_from_slice(pass);

        debug!(id, "Sending PAP Authenticate-Request");
        let request = PppPacket::new(protocols::PAP, codes::AUTHENTICATE_REQUEST, id, payload);
        self.sink.send(&request.write_data_packet()).await?;

        loop {
            let frame = match self.mailbox.recv().await {
                Some(frame) => frame,
                None => return Err(Error::Io("mailbox closed".into())),
            };

            match frame.code {
                codes::AUTHENTICATE_ACK if frame.id == id => {
                    info!("PAP authentication succeeded");
                    self.session.negotiated().hlak = Some(vec![0u8; ZERO_HLAK_LEN]);
                    return Ok(());
                }
                codes::AUTHENTICATE_NAK if frame.id == id => {
                    return Err(Error::AuthenticationFailed);
                }
                other => {
                    debug!(code = other, id = frame.id, "Unmatched PAP frame ignored");
                }
            }
        }
    }
}
