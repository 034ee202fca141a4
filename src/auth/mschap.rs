//! MS-CHAPv2 authenticator carried in PPP CHAP - RFC 2759.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ppp::{protocols, PppPacket};
use crate::crypto::{self, mschap};
use crate::error::Error;
use crate::mailbox::PppMailbox;
use crate::message::{ControlMessage, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

/// CHAP frame codes.
mod codes {
    pub const CHALLENGE: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const SUCCESS: u8 = 3;
    pub const FAILURE: u8 = 4;
}

/// Size of the MS-CHAPv2 challenge value.
const CHALLENGE_LEN: usize = 16;

/// Size of the MS-CHAPv2 response value:
/// peer challenge + 8 reserved + NT response + flags.
const RESPONSE_LEN: usize = 49;

/// One round of challenge state.
struct Round {
    id: u8,
    authenticator_challenge: [u8; 16],
    peer_challenge: [u8; 16],
    nt_response: [u8; 24],
}

/// The MS-CHAPv2 authentication task.
pub struct MschapAuthenticator {
    mailbox: PppMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl MschapAuthenticator {
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
                Ok(Ok(())) => ControlMessage::proceeded(Where::Chap),
                Ok(Err(error)) => ControlMessage::failed(Where::Chap, error),
                Err(_) => ControlMessage::failed(Where::Chap, Error::Timeout),
            },
        };
        let _ = self.control.send(message).await;
    }

    async fn authenticate(&mut self) -> Result<(), Error> {
        let mut round: Option<Round> = None;

        loop {
            let frame = match self.mailbox.recv().await {
                Some(frame) => frame,
                None => return Err(Error::Io("mailbox closed".into())),
            };

            match frame.code {
                codes::CHALLENGE => {
                    round = Some(self.answer_challenge(&frame).await?);
                }
                codes::SUCCESS => {
                    let round = round
                        .as_ref()
                        .ok_or_else(|| Error::unexpected("CHAP Success before Challenge"))?;
                    self.verify_success(round, &frame.payload)?;

                    let key =
                        mschap::master_key(&self.session.config.password, &round.nt_response);
                    self.session.negotiated().hlak = Some(key.to_vec());
                    info!("MS-CHAPv2 authentication succeeded");
                    return Ok(());
                }
                codes::FAILURE => {
                    warn!("Server reported MS-CHAPv2 failure");
                    return Err(Error::AuthenticationFailed);
                }
                other => {
                    debug!(code = other, "Unexpected CHAP code ignored");
                }
            }
        }
    }

    /// Compute and send the Response for a server Challenge.
    async fn answer_challenge(&mut self, frame: &PppPacket) -> Result<Round, Error> {
        let payload = &frame.payload;
        let value_size = *payload
            .first()
            .ok_or_else(|| Error::parse("empty CHAP challenge"))? as usize;
        if value_size != CHALLENGE_LEN || payload.len() < 1 + CHALLENGE_LEN {
            return Err(Error::parse(format!(
                "CHAP challenge value size {value_size}"
            )));
        }

        let mut authenticator_challenge = [0u8; 16];
        authenticator_challenge.copy_from_slice(&payload[1..1 + CHALLENGE_LEN]);

        let config = &self.session.config;
        let peer_challenge: [u8; 16] = crypto::random_bytes();
        let nt_response = mschap::nt_response(
            &authenticator_challenge,
            &peer_challenge,
            &config.username,
            &config.password,
        );

        let mut value = Vec::with_capacity(1 + RESPONSE_LEN + config.username.len());
        value.push(RESPONSE_LEN as u8);
        value.extend_from_slice(&peer_challenge);
        value.extend_from_slice(&[0u8; 8]);
        value.extend_from_slice(&nt_response);
        value.push(0); // flags
        value.extend_from_slice(config.username.as_bytes());

        debug!(id = frame.id, "Answering MS-CHAPv2 challenge");
        let response = PppPacket::new(protocols::CHAP, codes::RESPONSE, frame.id, value);
        self.sink.send(&response.write_data_packet()).await?;

        Ok(Round {
            id: frame.id,
            authenticator_challenge,
            peer_challenge,
            nt_response,
        })
    }

    /// Check the authenticator response inside the Success message.
    fn verify_success(&self, round: &Round, payload: &[u8]) -> Result<(), Error> {
        let message = String::from_utf8_lossy(payload);
        let expected = mschap::authenticator_response(
            &self.session.config.password,
            &round.nt_response,
            &round.peer_challenge,
            &round.authenticator_challenge,
            &self.session.config.username,
        );

        if !message.contains(&expected) {
            warn!(id = round.id, "Server authenticator response did not verify");
            return Err(Error::AuthenticationFailed);
        }
        Ok(())
    }
}
