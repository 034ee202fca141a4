//! SSTP control client.
//!
//! Two tasks share the SSTP control mailbox across the session's life:
//! the request task drives Call-Connect-Request → Call-Connect-Ack
//! during call setup, and the control task answers echoes and watches
//! for peer-initiated teardown once the call is connected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::sstp::{Attribute, ControlPacket, MessageType};
use crate::crypto::{self, HashProtocol};
use crate::error::Error;
use crate::mailbox::SstpMailbox;
use crate::message::{ControlMessage, PhaseFailure, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

use super::binding;

/// Gap between Call-Connect-Request attempts.
pub const REQUEST_INTERVAL: Duration = Duration::from_secs(60);

/// Call-Connect-Request attempt budget.
pub const MAX_ATTEMPTS: u32 = 3;

/// The call-setup request task.
pub struct SstpRequest {
    mailbox: SstpMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl SstpRequest {
    pub fn new(
        mailbox: SstpMailbox,
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

    /// Run the request exchange, reporting one outcome, and hand the
    /// mailbox back for the post-connected control task.
    pub async fn run(mut self) -> Option<SstpMailbox> {
        let cancel = self.cancel.clone();
        let message = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.request() => match result {
                Ok(()) => ControlMessage::proceeded(Where::SstpRequest),
                Err(error) => ControlMessage::failed(Where::SstpRequest, error),
            },
        };
        let _ = self.control.send(message).await;
        Some(self.mailbox)
    }

    async fn request(&mut self) -> Result<(), Error> {
        for attempt in 1..=MAX_ATTEMPTS {
            debug!(attempt, "Sending Call-Connect-Request");
            self.sink
                .send(&ControlPacket::call_connect_request().write())
                .await?;

            match timeout(REQUEST_INTERVAL, self.mailbox.recv()).await {
                Err(_) => continue,
                Ok(None) => return Err(Error::Io("mailbox closed".into())),
                Ok(Some(packet)) => return self.accept(packet),
            }
        }
        Err(Error::Timeout)
    }

    /// Exactly one answer is acceptable: an Ack carrying one
    /// Crypto-Binding-Request.
    fn accept(&mut self, packet: ControlPacket) -> Result<(), Error> {
        match packet.message_type {
            MessageType::CallConnectAck => {
                let request = match packet.single_attribute() {
                    Some(Attribute::CryptoBindingRequest(request)) => *request,
                    _ => {
                        return Err(Error::unexpected(
                            "Call-Connect-Ack without a Crypto-Binding-Request",
                        ))
                    }
                };

                let proto = match request.hash_bitmask {
                    2 | 3 => HashProtocol::Sha256,
                    1 => HashProtocol::Sha1,
                    other => {
                        return Err(Error::unknown(format!("hash-protocol bitmask {other}")))
                    }
                };

                info!(hash = ?proto, "Call accepted");
                let mut negotiated = self.session.negotiated();
                negotiated.nonce = request.nonce;
                negotiated.hash_protocol = proto;
                Ok(())
            }
            MessageType::CallConnectNak => Err(Error::NegativeAcknowledged),
            MessageType::CallDisconnect => Err(Error::DisconnectRequested),
            MessageType::CallAbort => Err(Error::AbortRequested),
            other => Err(Error::unexpected(format!("{other:?} during call setup"))),
        }
    }
}

/// Assemble and send Call-Connected once authentication has finished.
///
/// The crypto binding echoes the server nonce and carries the leaf
/// certificate hash under the negotiated hash protocol. The HLAK falls
/// back to 32 zero bytes when no key-producing method ran.
pub async fn send_call_connected(
    sink: &TunnelSink,
    session: &Session,
    leaf_der: &[u8],
) -> Result<(), PhaseFailure> {
    let (proto, hlak, nonce) = {
        let negotiated = session.negotiated();
        (
            negotiated.hash_protocol,
            negotiated
                .hlak
                .clone()
                .unwrap_or_else(|| vec![0u8; crate::auth::ZERO_HLAK_LEN]),
            negotiated.nonce,
        )
    };

    let cert_hash = crypto::cert_hash(proto, leaf_der);
    let packet = binding::build_call_connected(proto, &hlak, nonce, cert_hash);

    debug!("Sending Call-Connected");
    sink.send(&packet)
        .await
        .map_err(|e| PhaseFailure::new(Where::SstpRequest, e))
}

/// The post-connected control task.
pub struct SstpControl {
    mailbox: SstpMailbox,
    sink: TunnelSink,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl SstpControl {
    pub fn new(
        mailbox: SstpMailbox,
        sink: TunnelSink,
        control: mpsc::Sender<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mailbox,
            sink,
            control,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return,
                packet = self.mailbox.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };

            let error = match packet.message_type {
                MessageType::EchoRequest => {
                    debug!("SSTP echo request, responding");
                    let response = ControlPacket::bare(MessageType::EchoResponse).write();
                    if let Err(e) = self.sink.send(&response).await {
                        warn!("Failed to send SSTP echo response: {e}");
                    }
                    continue;
                }
                MessageType::EchoResponse => continue,
                MessageType::CallDisconnect => Error::DisconnectRequested,
                MessageType::CallAbort => Error::AbortRequested,
                other => Error::unexpected(format!("{other:?} while connected")),
            };

            let _ = self
                .control
                .send(ControlMessage::failed(Where::SstpControl, error))
                .await;
            return;
        }
    }
}
