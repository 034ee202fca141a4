//! EAP-MSCHAPv2 authenticator - RFC 3748 framing around the RFC 2759
//! challenge/response exchange.

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

/// EAP codes (the PPP frame code carries them directly).
mod codes {
    pub const REQUEST: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const SUCCESS: u8 = 3;
    pub const FAILURE: u8 = 4;
}

/// EAP method types.
mod types {
    pub const IDENTITY: u8 = 1;
    pub const NAK: u8 = 3;
    pub const MSCHAPV2: u8 = 26;
}

/// Inner MS-CHAPv2 operation codes.
mod ops {
    pub const CHALLENGE: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const SUCCESS: u8 = 3;
    pub const FAILURE: u8 = 4;
}

/// Round state carried from Challenge to Success.
struct Round {
    authenticator_challenge: [u8; 16],
    peer_challenge: [u8; 16],
    nt_response: [u8; 24],
}

/// The EAP-MSCHAPv2 authentication task.
pub struct EapAuthenticator {
    mailbox: PppMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl EapAuthenticator {
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
                Ok(Ok(())) => ControlMessage::proceeded(Where::Eap),
                Ok(Err(error)) => ControlMessage::failed(Where::Eap, error),
                Err(_) => ControlMessage::failed(Where::Eap, Error::Timeout),
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
                codes::REQUEST => {
                    let method = *frame
                        .payload
                        .first()
                        .ok_or_else(|| Error::parse("EAP request without type"))?;
                    match method {
                        types::IDENTITY => self.send_identity(frame.id).await?,
                        types::MSCHAPV2 => {
                            self.handle_mschap(frame.id, &frame.payload[1..], &mut round)
                                .await?;
                        }
                        other => {
                            // Steer the server toward the one method we speak.
                            debug!(method = other, "Nak'ing unsupported EAP method");
                            self.send_response(frame.id, types::NAK, &[types::MSCHAPV2])
                                .await?;
                        }
                    }
                }
                codes::SUCCESS => {
                    let round = round
                        .as_ref()
                        .ok_or_else(|| Error::unexpected("EAP Success before Challenge"))?;
                    let key =
                        mschap::master_key(&self.session.config.password, &round.nt_response);
                    self.session.negotiated().hlak = Some(key.to_vec());
                    info!("EAP-MSCHAPv2 authentication succeeded");
                    return Ok(());
                }
                codes::FAILURE => {
                    warn!("Server reported EAP failure");
                    return Err(Error::AuthenticationFailed);
                }
                other => {
                    debug!(code = other, "Unexpected EAP code ignored");
                }
            }
        }
    }

    /// Respond to an Identity request with the configured username.
    async fn send_identity(&mut self, id: u8) -> Result<(), Error> {
        debug!(id, "Answering EAP identity request");
        let username = self.session.config.username.clone();
        self.send_response(id, types::IDENTITY, username.as_bytes())
            .await
    }

    /// Process one inner MS-CHAPv2 operation.
    async fn handle_mschap(
        &mut self,
        id: u8,
        data: &[u8],
        round: &mut Option<Round>,
    ) -> Result<(), Error> {
        let op = *data
            .first()
            .ok_or_else(|| Error::parse("empty EAP-MSCHAPv2 payload"))?;

        match op {
            ops::CHALLENGE => {
                // [op][ms-id][ms-length][value-size][challenge][name]
                if data.len() < 5 || data[4] as usize != 16 || data.len() < 21 {
                    return Err(Error::parse("malformed EAP-MSCHAPv2 challenge"));
                }
                let ms_id = data[1];
                let mut authenticator_challenge = [0u8; 16];
                authenticator_challenge.copy_from_slice(&data[5..21]);

                let config = &self.session.config;
                let peer_challenge: [u8; 16] = crypto::random_bytes();
                let nt_response = mschap::nt_response(
                    &authenticator_challenge,
                    &peer_challenge,
                    &config.username,
                    &config.password,
                );

                // Inner response: value-size 49, the 49-byte value, name.
                let mut value = Vec::with_capacity(54 + config.username.len());
                value.push(49);
                value.extend_from_slice(&peer_challenge);
                value.extend_from_slice(&[0u8; 8]);
                value.extend_from_slice(&nt_response);
                value.push(0); // flags
                value.extend_from_slice(config.username.as_bytes());

                let ms_length = (4 + value.len()) as u16;
                let mut inner = Vec::with_capacity(4 + value.len());
                inner.push(ops::RESPONSE);
                inner.push(ms_id);
                inner.extend_from_slice(&ms_length.to_be_bytes());
                inner.extend_from_slice(&value);

                debug!(id, ms_id, "Answering EAP-MSCHAPv2 challenge");
                self.send_response(id, types::MSCHAPV2, &inner).await?;

                *round = Some(Round {
                    authenticator_challenge,
                    peer_challenge,
                    nt_response,
                });
                Ok(())
            }
            ops::SUCCESS => {
                let round = round
                    .as_ref()
                    .ok_or_else(|| Error::unexpected("EAP-MSCHAPv2 Success before Challenge"))?;

                // [op][ms-id][ms-length]["S=..." message]
                let message = String::from_utf8_lossy(data.get(4..).unwrap_or_default());
                let expected = mschap::authenticator_response(
                    &self.session.config.password,
                    &round.nt_response,
                    &round.peer_challenge,
                    &round.authenticator_challenge,
                    &self.session.config.username,
                );
                if !message.contains(&expected) {
                    warn!("EAP-MSCHAPv2 authenticator response did not verify");
                    return Err(Error::AuthenticationFailed);
                }

                debug!(id, "Acknowledging EAP-MSCHAPv2 success");
                self.send_response(id, types::MSCHAPV2, &[ops::SUCCESS]).await
            }
            ops::FAILURE => {
                warn!("Server sent EAP-MSCHAPv2 failure request");
                Err(Error::AuthenticationFailed)
            }
            other => Err(Error::unexpected(format!(
                "EAP-MSCHAPv2 operation {other}"
            ))),
        }
    }

    /// Send one EAP Response frame.
    async fn send_response(&mut self, id: u8, method: u8, data: &[u8]) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(method);
        payload.extend_from_slice(data);

        let response = PppPacket::new(protocols::EAP, codes::RESPONSE, id, payload);
        self.sink.send(&response.write_data_packet()).await?;
        Ok(())
    }
}
