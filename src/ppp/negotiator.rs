//! Generic Configure-Request negotiation engine.
//!
//! LCP, IPCP and IPv6CP all run the same state machine and differ only
//! in their option sets and acceptance rules, supplied through
//! [`NegotiationPolicy`]. The machine keeps at most one Configure-Request
//! outstanding, ignores replies whose identifier does not match it, and
//! is open once both sides have acknowledged a request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::ppp::{codes, PppPacket, RawOption};
use crate::error::Error;
use crate::mailbox::PppMailbox;
use crate::message::{ControlMessage, PhaseFailure, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

/// Gap between Configure-Request (re)transmissions.
pub const REQUEST_INTERVAL: Duration = Duration::from_secs(3);

/// Retransmission budget per negotiation.
pub const MAX_REQUESTS: i32 = 10;

/// Total budget for one negotiation phase.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-protocol policy hooks for the shared negotiation machine.
pub trait NegotiationPolicy: Send {
    /// Options in the peer's request we must Configure-Reject, verbatim.
    fn server_reject(&self, options: &[RawOption]) -> Vec<RawOption>;

    /// Counter-proposals for peer options we cannot accept as offered.
    fn server_nak(&self, options: &[RawOption]) -> Vec<RawOption>;

    /// The peer's request is acceptable; record whatever it decides.
    fn accept_server(&mut self, options: &[RawOption]);

    /// Options for our next Configure-Request.
    fn client_request(&mut self) -> Vec<RawOption>;

    /// The peer Nak'd our request with counter-proposals.
    fn accept_client_nak(&mut self, options: &[RawOption]) -> Result<(), PhaseFailure>;

    /// The peer rejected options from our request outright.
    fn accept_client_reject(&mut self, options: &[RawOption]) -> Result<(), PhaseFailure>;
}

/// One negotiation task.
pub struct Negotiator<P: NegotiationPolicy> {
    protocol: u16,
    where_tag: Where,
    policy: P,
    mailbox: PppMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl<P: NegotiationPolicy> Negotiator<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: u16,
        where_tag: Where,
        policy: P,
        mailbox: PppMailbox,
        sink: TunnelSink,
        session: Arc<Session>,
        control: mpsc::Sender<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            where_tag,
            policy,
            mailbox,
            sink,
            session,
            control,
            cancel,
        }
    }

    /// Run the negotiation and report exactly one outcome.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            result = timeout(PHASE_TIMEOUT, self.negotiate()) => match result {
                Ok(Ok(())) => ControlMessage::proceeded(self.where_tag),
                Ok(Err(failure)) => ControlMessage::failed(failure.at, failure.error),
                Err(_) => ControlMessage::failed(self.where_tag, Error::Timeout),
            },
        };
        let _ = self.control.send(message).await;
    }

    async fn negotiate(&mut self) -> Result<(), PhaseFailure> {
        let mut client_ready = false;
        let mut server_ready = false;
        let mut counter = MAX_REQUESTS;
        let mut id = self.send_request().await?;

        loop {
            let frame = match timeout(REQUEST_INTERVAL, self.mailbox.recv()).await {
                Err(_) => {
                    client_ready = false;
                    counter -= 1;
                    if counter < 0 {
                        return Err(PhaseFailure::new(self.where_tag, Error::CountExhausted));
                    }
                    id = self.send_request().await?;
                    continue;
                }
                Ok(None) => {
                    // Router gone: the engine is tearing down around us.
                    return Err(PhaseFailure::new(
                        self.where_tag,
                        Error::Io("mailbox closed".into()),
                    ));
                }
                Ok(Some(frame)) => frame,
            };

            if frame.code == codes::CONFIGURE_REQUEST {
                server_ready = false;
                let options = frame
                    .options()
                    .map_err(|e| PhaseFailure::new(self.where_tag, e))?;

                let rejects = self.policy.server_reject(&options);
                if !rejects.is_empty() {
                    trace!(id = frame.id, count = rejects.len(), "Rejecting peer options");
                    self.send_reply(codes::CONFIGURE_REJECT, frame.id, &rejects)
                        .await?;
                    continue;
                }

                let naks = self.policy.server_nak(&options);
                if !naks.is_empty() {
                    trace!(id = frame.id, count = naks.len(), "Nak'ing peer options");
                    self.send_reply(codes::CONFIGURE_NAK, frame.id, &naks).await?;
                    continue;
                }

                self.policy.accept_server(&options);
                self.send_reply(codes::CONFIGURE_ACK, frame.id, &options)
                    .await?;
                server_ready = true;
            } else {
                if client_ready {
                    // A reply after we were satisfied reopens our side.
                    client_ready = false;
                    id = self.send_request().await?;
                    continue;
                }
                if frame.id != id {
                    trace!(got = frame.id, want = id, "Stale reply identifier, ignored");
                    continue;
                }
                match frame.code {
                    codes::CONFIGURE_ACK => client_ready = true,
                    codes::CONFIGURE_NAK => {
                        let options = frame
                            .options()
                            .map_err(|e| PhaseFailure::new(self.where_tag, e))?;
                        self.policy.accept_client_nak(&options)?;
                        id = self.send_request().await?;
                    }
                    codes::CONFIGURE_REJECT => {
                        let options = frame
                            .options()
                            .map_err(|e| PhaseFailure::new(self.where_tag, e))?;
                        self.policy.accept_client_reject(&options)?;
                        id = self.send_request().await?;
                    }
                    other => {
                        trace!(code = other, "Non-configure code ignored by negotiator");
                    }
                }
            }

            if client_ready && server_ready {
                debug!(protocol = format!("0x{:04X}", self.protocol), "Negotiation open");
                return Ok(());
            }
        }
    }

    async fn send_request(&mut self) -> Result<u8, PhaseFailure> {
        let options = self.policy.client_request();
        let id = self.session.next_frame_id();
        let packet =
            PppPacket::with_options(self.protocol, codes::CONFIGURE_REQUEST, id, &options);
        trace!(id, count = options.len(), "Sending Configure-Request");
        self.sink
            .send(&packet.write_data_packet())
            .await
            .map_err(|e| PhaseFailure::new(self.where_tag, e))?;
        Ok(id)
    }

    async fn send_reply(
        &mut self,
        code: u8,
        id: u8,
        options: &[RawOption],
    ) -> Result<(), PhaseFailure> {
        let packet = PppPacket::with_options(self.protocol, code, id, options);
        self.sink
            .send(&packet.write_data_packet())
            .await
            .map_err(|e| PhaseFailure::new(self.where_tag, e))
    }
}
