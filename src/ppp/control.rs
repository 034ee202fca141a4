//! PPP control task.
//!
//! Bound to the LCP protocol number after the network phase opens, plus
//! the unknown-protocol fallback. Answers Echo-Requests, acknowledges a
//! peer Terminate-Request before reporting it, and turns frames of
//! unimplemented protocols into Protocol-Rejects.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::ppp::{codes, protocols, PppPacket};
use crate::error::Error;
use crate::mailbox::PppMailbox;
use crate::message::{ControlMessage, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

/// The long-running PPP control task.
pub struct PppControl {
    mailbox: PppMailbox,
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl PppControl {
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

    /// Run until cancellation or an LCP-level teardown event.
    pub async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = self.mailbox.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };

            if frame.protocol != protocols::LCP {
                self.protocol_reject(frame).await;
                continue;
            }

            match frame.code {
                codes::ECHO_REQUEST => {
                    trace!(id = frame.id, "LCP echo request");
                    let reply = PppPacket::new(
                        protocols::LCP,
                        codes::ECHO_REPLY,
                        frame.id,
                        frame.payload,
                    );
                    if let Err(e) = self.sink.send(&reply.write_data_packet()).await {
                        warn!("Failed to send echo reply: {e}");
                    }
                }
                codes::ECHO_REPLY | codes::DISCARD_REQUEST => {
                    // Liveness was already recorded by the demultiplexer.
                }
                codes::TERMINATE_REQUEST => {
                    debug!(id = frame.id, "Peer requested termination");
                    let ack = PppPacket::new(
                        protocols::LCP,
                        codes::TERMINATE_ACK,
                        frame.id,
                        Vec::new(),
                    );
                    let _ = self.sink.send(&ack.write_data_packet()).await;
                    let _ = self
                        .control
                        .send(ControlMessage::failed(
                            Where::PppControl,
                            Error::TerminateRequested,
                        ))
                        .await;
                    return;
                }
                codes::PROTOCOL_REJECT => {
                    let _ = self
                        .control
                        .send(ControlMessage::failed(
                            Where::PppControl,
                            Error::ProtocolRejected,
                        ))
                        .await;
                    return;
                }
                codes::CODE_REJECT => {
                    let _ = self
                        .control
                        .send(ControlMessage::failed(
                            Where::PppControl,
                            Error::CodeRejected,
                        ))
                        .await;
                    return;
                }
                other => {
                    trace!(code = other, "LCP code ignored in steady state");
                }
            }
        }
    }

    /// Answer a frame of an unimplemented protocol with Protocol-Reject:
    /// the rejected protocol number followed by the offending frame.
    async fn protocol_reject(&mut self, frame: PppPacket) {
        debug!(
            protocol = format!("0x{:04X}", frame.protocol),
            "Rejecting unknown PPP protocol"
        );

        let mut payload = Vec::with_capacity(6 + frame.payload.len());
        payload.extend_from_slice(&frame.protocol.to_be_bytes());
        payload.push(frame.code);
        payload.push(frame.id);
        payload.extend_from_slice(&((4 + frame.payload.len()) as u16).to_be_bytes());
        payload.extend_from_slice(&frame.payload);

        let reject = PppPacket::new(
            protocols::LCP,
            codes::PROTOCOL_REJECT,
            self.session.next_frame_id(),
            payload,
        );
        if let Err(e) = self.sink.send(&reject.write_data_packet()).await {
            warn!("Failed to send protocol reject: {e}");
        }
    }
}
