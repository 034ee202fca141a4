//! Incoming demultiplexer.
//!
//! Owns the transport read half. Delimits the TLS byte stream into SSTP
//! packets, classifies DATA vs CONTROL, routes PPP control frames to the
//! active mailboxes and L3 payloads toward the device. Also owns both
//! echo timers: they are ticked and polled on this task only.
//!
//! Loop invariant: the buffer holds zero or more complete SSTP packets
//! followed by at most one partial packet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::ppp::{self, PppPacket};
use crate::codec::sstp::{self, ControlPacket};
use crate::error::Error;
use crate::mailbox::{FrameRouter, Routed};
use crate::message::{ControlMessage, PhaseFailure, Where};
use crate::session::Session;
use crate::timer::{EchoTimer, Liveness, ECHO_INTERVAL};
use crate::transport::{TunnelSink, TunnelSource};

/// Largest SSTP packet the receive buffer will hold.
pub const MAX_PACKET: usize = 4096;

/// Read timeout once the tunnel is up; expiry only drives timer polls.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The incoming pump task.
pub struct Demux {
    source: TunnelSource,
    sink: TunnelSink,
    router: FrameRouter,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
    sstp_timer: EchoTimer,
    ppp_timer: EchoTimer,
}

impl Demux {
    pub fn new(
        source: TunnelSource,
        sink: TunnelSink,
        router: FrameRouter,
        session: Arc<Session>,
        control: mpsc::Sender<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            source,
            sink,
            router,
            session,
            control,
            cancel,
            sstp_timer: EchoTimer::new(ECHO_INTERVAL, now),
            ppp_timer: EchoTimer::new(ECHO_INTERVAL, now),
        }
    }

    /// Run until cancellation or a terminal error.
    pub async fn run(mut self) {
        if let Err(failure) = self.pump().await {
            let _ = self
                .control
                .send(ControlMessage::failed(failure.at, failure.error))
                .await;
        }
    }

    async fn pump(&mut self) -> Result<(), PhaseFailure> {
        let mut buf = BytesMut::with_capacity(MAX_PACKET * 2);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            // Header first: the packet length sits in bytes 2..4.
            while buf.len() < sstp::HEADER_LEN {
                self.fill(&mut buf).await?;
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }

            let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if length < sstp::HEADER_LEN || length > MAX_PACKET {
                return Err(PhaseFailure::new(
                    Where::Demux,
                    Error::InvalidPacketSize(length),
                ));
            }

            while buf.len() < length {
                self.fill(&mut buf).await?;
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
            }

            let packet = buf.copy_to_bytes(length);
            self.sstp_timer.tick(Instant::now());
            self.dispatch(&packet)?;
            self.check_timers().await?;
        }
    }

    /// Pull more bytes from the transport. Timeouts are non-fatal; they
    /// exist so the timers are polled on a quiet link.
    async fn fill(&mut self, buf: &mut BytesMut) -> Result<(), PhaseFailure> {
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            read = tokio::time::timeout(READ_TIMEOUT, self.source.read_buf(buf)) => read,
        };

        match read {
            Ok(Ok(0)) => Err(PhaseFailure::new(
                Where::Demux,
                Error::Io("server closed the tunnel".into()),
            )),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PhaseFailure::new(Where::Demux, Error::from(e))),
            Err(_) => {
                self.check_timers().await?;
                Ok(())
            }
        }
    }

    /// Classify and route one complete SSTP packet.
    fn dispatch(&mut self, packet: &[u8]) -> Result<(), PhaseFailure> {
        let packet_type = u16::from_be_bytes([packet[0], packet[1]]);
        match packet_type {
            sstp::PACKET_DATA => self.dispatch_data(packet),
            sstp::PACKET_CONTROL => {
                let parsed = ControlPacket::parse(packet)
                    .map_err(|e| PhaseFailure::new(Where::Demux, e))?;
                trace!(message = ?parsed.message_type, "SSTP control packet");
                if self.router.route_sstp(parsed) != Routed::Delivered {
                    debug!("SSTP control packet with no receiver, dropped");
                }
                Ok(())
            }
            other => Err(PhaseFailure::new(
                Where::Demux,
                Error::unknown(format!("SSTP packet type 0x{other:04X}")),
            )),
        }
    }

    fn dispatch_data(&mut self, packet: &[u8]) -> Result<(), PhaseFailure> {
        let ppp = &packet[sstp::HEADER_LEN..];
        if ppp.len() < 4 || ppp[..2] != ppp::HDLC_HEADER {
            return Err(PhaseFailure::new(
                Where::Demux,
                Error::parse("DATA packet without HDLC header"),
            ));
        }

        // Only HDLC-framed DATA packets count as PPP liveness.
        self.ppp_timer.tick(Instant::now());

        let protocol = u16::from_be_bytes([ppp[2], ppp[3]]);
        match protocol {
            ppp::protocols::IPV4 | ppp::protocols::IPV6 => {
                let enabled = if protocol == ppp::protocols::IPV4 {
                    self.session.config.ppp.ipv4_enabled
                } else {
                    self.session.config.ppp.ipv6_enabled
                };
                if !enabled {
                    trace!(protocol, "Datagram for disabled family, dropped");
                    return Ok(());
                }
                let payload = packet[sstp::HEADER_LEN + ppp::PPP_HEADER_LEN..].to_vec();
                if self.router.route_data(payload) != Routed::Delivered {
                    trace!("No data receiver yet, datagram dropped");
                }
                Ok(())
            }
            ppp::protocols::LCP
            | ppp::protocols::PAP
            | ppp::protocols::CHAP
            | ppp::protocols::EAP
            | ppp::protocols::IPCP
            | ppp::protocols::IPV6CP => {
                let parsed = PppPacket::parse(ppp)
                    .map_err(|e| PhaseFailure::new(Where::Demux, e))?;
                if self.router.route_ppp(parsed) != Routed::Delivered {
                    debug!(protocol = format!("0x{protocol:04X}"),
                        "PPP frame with no receiver, dropped");
                }
                Ok(())
            }
            other => {
                let parsed = PppPacket::parse(ppp)
                    .map_err(|e| PhaseFailure::new(Where::Demux, e))?;
                match self.router.route_unknown(parsed) {
                    Routed::Unclaimed => Err(PhaseFailure::new(
                        Where::Demux,
                        Error::unknown(format!("PPP protocol 0x{other:04X}")),
                    )),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Poll both echo timers, sending echo requests as needed.
    async fn check_timers(&mut self) -> Result<(), PhaseFailure> {
        let now = Instant::now();

        match self.sstp_timer.check_alive(now) {
            Liveness::Alive => {}
            Liveness::SendEcho => {
                debug!("Link quiet, sending SSTP echo request");
                let echo = ControlPacket::bare(sstp::MessageType::EchoRequest).write();
                if let Err(e) = self.sink.send(&echo).await {
                    warn!("Failed to send SSTP echo: {e}");
                }
            }
            Liveness::Dead => {
                return Err(PhaseFailure::new(Where::SstpControl, Error::Timeout));
            }
        }

        match self.ppp_timer.check_alive(now) {
            Liveness::Alive => {}
            Liveness::SendEcho => {
                debug!("PPP layer quiet, sending LCP echo request");
                let echo = PppPacket::new(
                    ppp::protocols::LCP,
                    ppp::codes::ECHO_REQUEST,
                    self.session.next_frame_id(),
                    vec![0, 0, 0, 0],
                );
                if let Err(e) = self.sink.send(&echo.write_data_packet()).await {
                    warn!("Failed to send LCP echo: {e}");
                }
            }
            Liveness::Dead => {
                return Err(PhaseFailure::new(Where::PppControl, Error::Timeout));
            }
        }

        Ok(())
    }
}
