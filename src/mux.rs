//! Outgoing multiplexer.
//!
//! Reads L3 datagrams from the virtual device, wraps each with the SSTP
//! DATA + HDLC + protocol headers and writes them to the tunnel. Device
//! reads are blocking, so they run on a dedicated blocking task that
//! alternates two preallocated buffers through a pair of channels; the
//! async side coalesces back-to-back datagrams into one TLS write while
//! spare capacity remains.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::ppp::{self, wrap_datagram};
use crate::device::TunReader;
use crate::error::Error;
use crate::mailbox::DataMailbox;
use crate::message::{ControlMessage, Where};
use crate::session::Session;
use crate::transport::TunnelSink;

/// Per-datagram overhead: SSTP header + HDLC + protocol.
const WRAP_OVERHEAD: usize = 8;

/// Pump inbound L3 payloads from the demultiplexer to the device.
///
/// Device writes block, so the actual writing happens on a blocking
/// task fed through a channel; this task only forwards and watches for
/// cancellation.
pub async fn run_device_writer(
    mut mailbox: DataMailbox,
    writer: Box<dyn crate::device::TunWriter>,
    cancel: CancellationToken,
) {
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();

    let writer_task = tokio::task::spawn_blocking(move || {
        let mut writer = writer;
        while let Ok(payload) = rx.recv() {
            if let Err(e) = writer.write(&payload, 0, payload.len()) {
                debug!("Device write ended: {e}");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = mailbox.recv() => match payload {
                Some(payload) => {
                    if tx.send(payload).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    drop(tx);
    let _ = writer_task.await;
}

/// One filled device buffer: the storage and the datagram length.
type Filled = (Vec<u8>, usize);

/// The outgoing pump task.
pub struct Mux {
    sink: TunnelSink,
    session: Arc<Session>,
    control: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl Mux {
    pub fn new(
        sink: TunnelSink,
        session: Arc<Session>,
        control: mpsc::Sender<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            session,
            control,
            cancel,
        }
    }

    /// Run until cancellation or a terminal error, pulling from `reader`.
    pub async fn run(self, reader: Box<dyn TunReader>) {
        let mtu = self.session.config.ppp.mtu as usize;

        // Two alternating buffers: one refilling on the blocking reader
        // while the other is in flight here.
        let (filled_tx, mut filled_rx) = mpsc::channel::<Filled>(1);
        let (empty_tx, empty_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        for _ in 0..2 {
            empty_tx.send(vec![0u8; mtu]).expect("receiver alive");
        }

        let reader_task = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            while let Ok(mut buf) = empty_rx.recv() {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if filled_tx.blocking_send((buf, n)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Device read ended: {e}");
                        break;
                    }
                }
            }
        });

        // Coalescing write buffer: room for two full frames.
        let mut send_buf: Vec<u8> = Vec::with_capacity(2 * (mtu + WRAP_OVERHEAD));

        loop {
            let (buf, len) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                filled = filled_rx.recv() => match filled {
                    Some(filled) => filled,
                    None => {
                        let _ = self
                            .control
                            .send(ControlMessage::failed(
                                Where::Mux,
                                Error::Io("device reader stopped".into()),
                            ))
                            .await;
                        break;
                    }
                },
            };

            send_buf.clear();
            self.append_datagram(&buf[..len], &mut send_buf).await;
            let _ = empty_tx.send(buf);

            // Coalesce whatever else is already waiting, while one more
            // full frame still fits.
            while send_buf.capacity() - send_buf.len() > mtu + WRAP_OVERHEAD {
                match filled_rx.try_recv() {
                    Ok((buf, len)) => {
                        self.append_datagram(&buf[..len], &mut send_buf).await;
                        let _ = empty_tx.send(buf);
                    }
                    Err(_) => break,
                }
            }

            if send_buf.is_empty() {
                continue;
            }

            if let Err(e) = self.sink.send(&send_buf).await {
                if !self.cancel.is_cancelled() {
                    let _ = self
                        .control
                        .send(ControlMessage::failed(Where::Mux, e))
                        .await;
                }
                break;
            }
        }

        drop(filled_rx);
        reader_task.abort();
    }

    /// Classify one datagram by its first nibble and append the wrapped
    /// frame, dropping datagrams of disabled or unknown families.
    async fn append_datagram(&self, datagram: &[u8], out: &mut Vec<u8>) {
        if datagram.is_empty() {
            return;
        }

        let config = &self.session.config.ppp;
        let protocol = match datagram[0] >> 4 {
            4 => {
                if !config.ipv4_enabled {
                    trace!("IPv4 disabled, outgoing datagram dropped");
                    return;
                }
                ppp::protocols::IPV4
            }
            6 => {
                if !config.ipv6_enabled {
                    trace!("IPv6 disabled, outgoing datagram dropped");
                    return;
                }
                ppp::protocols::IPV6
            }
            other => {
                warn!(nibble = other, "Datagram with unknown IP version");
                let _ = self
                    .control
                    .send(ControlMessage::failed(
                        Where::Mux,
                        Error::unknown(format!("IP version nibble {other}")),
                    ))
                    .await;
                return;
            }
        };

        out.extend_from_slice(&wrap_datagram(protocol, datagram));
    }
}
