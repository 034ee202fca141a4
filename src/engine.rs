//! Engine: phase orchestration, shared state, and teardown.
//!
//! Phases run strictly in order; each must report `Proceeded` on the
//! control channel before the next starts. Any failure, from any task,
//! tears the whole tunnel down: cancel everything, best-effort send
//! Call-Disconnect then Call-Abort, close the transport and the device.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{EapAuthenticator, MschapAuthenticator, PapAuthenticator};
use crate::codec::ppp::protocols;
use crate::codec::sstp::{ControlPacket, MessageType};
use crate::config::{AuthProtocol, Config};
use crate::demux::Demux;
use crate::device::{Channel, Reporter, TrustStore, TunDevice, TunReader, TunWriter};
use crate::error::Error;
use crate::mailbox::{FrameRouter, Guard};
use crate::message::{ControlMessage, Outcome, PhaseFailure, Terminal, Where};
use crate::mux::{run_device_writer, Mux};
use crate::ppp::{IpcpPolicy, Ipv6cpPolicy, LcpPolicy, Negotiator, PppControl};
use crate::route;
use crate::session::Session;
use crate::sstp::{send_call_connected, SstpControl, SstpRequest};
use crate::transport::{self, Established, TunnelSink};

/// Engine budget for the SSTP request phase: three attempts at the
/// 60-second interval, plus slack.
const SSTP_REQUEST_BUDGET: Duration = Duration::from_secs(185);

/// Engine budget for one negotiation phase, a backstop over the
/// negotiator's own 30-second total.
const NEGOTIATION_BUDGET: Duration = Duration::from_secs(35);

/// Depth of the engine control channel.
const CONTROL_DEPTH: usize = 32;

/// How one run ended, before mapping to a [`Terminal`].
enum RunEnd {
    /// The host asked for an orderly shutdown.
    Shutdown,
    /// A layer failed.
    Failed(PhaseFailure),
}

impl From<PhaseFailure> for RunEnd {
    fn from(failure: PhaseFailure) -> Self {
        RunEnd::Failed(failure)
    }
}

/// The tunnel engine. One instance can run any number of attempts, one
/// at a time; reconnection policy stays with the host.
pub struct Engine {
    config: Arc<Config>,
    trust_store: Arc<dyn TrustStore>,
    reporter: Arc<dyn Reporter>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        trust_store: Arc<dyn TrustStore>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            trust_store,
            reporter,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token the host can cancel for an orderly shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// One tunnel attempt, end to end.
    pub async fn run(&self, device: Box<dyn TunDevice>) -> Terminal {
        let session = Session::new(self.config.clone());
        info!(host = %self.config.hostname, guid = %session.guid, "Starting tunnel attempt");

        let established = match transport::establish(
            &self.config,
            &session.guid,
            self.trust_store.as_ref(),
            self.reporter.as_ref(),
        )
        .await
        {
            Ok(established) => established,
            Err(failure) => {
                let terminal = Terminal {
                    from: failure.at,
                    error: Some(failure.error),
                };
                self.reporter
                    .notify(Channel::Error, &terminal.to_string(), 0);
                return terminal;
            }
        };

        self.run_on(session, established, device).await
    }

    /// Run call setup and the pumps over an established transport.
    ///
    /// Split from [`run`](Self::run) so tests can drive the engine over
    /// an in-memory stream.
    pub async fn run_on(
        &self,
        session: Arc<Session>,
        established: Established,
        device: Box<dyn TunDevice>,
    ) -> Terminal {
        let Established { stream, leaf_der } = established;
        let (source, write_half) = tokio::io::split(stream);
        let sink = TunnelSink::new(write_half);
        let router = FrameRouter::new();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_DEPTH);

        let mut run = Run {
            engine: self,
            session,
            sink: sink.clone(),
            router: router.clone(),
            cancel: cancel.clone(),
            control_tx: control_tx.clone(),
            control_rx,
            tasks: Vec::new(),
            guards: Vec::new(),
        };

        run.tasks.push(tokio::spawn(
            Demux::new(
                source,
                sink.clone(),
                router,
                run.session.clone(),
                control_tx,
                cancel.clone(),
            )
            .run(),
        ));

        let end = match run.drive(device, &leaf_der).await {
            Ok(()) => RunEnd::Shutdown,
            Err(end) => end,
        };

        // Teardown: stop every task, then best-effort tell the peer.
        cancel.cancel();
        let _ = sink
            .send(&ControlPacket::bare(MessageType::CallDisconnect).write())
            .await;
        let _ = sink
            .send(&ControlPacket::bare(MessageType::CallAbort).write())
            .await;
        sink.close().await;
        for task in &run.tasks {
            task.abort();
        }

        let terminal = match end {
            RunEnd::Shutdown => {
                info!("Tunnel closed by host request");
                let terminal = Terminal {
                    from: Where::SstpControl,
                    error: None,
                };
                self.reporter
                    .notify(Channel::Disconnect, &terminal.to_string(), 0);
                terminal
            }
            RunEnd::Failed(failure) => {
                warn!(%failure, "Tunnel terminated");
                let terminal = Terminal {
                    from: failure.at,
                    error: Some(failure.error),
                };
                self.reporter
                    .notify(Channel::Error, &terminal.to_string(), 0);
                terminal
            }
        };
        terminal
    }
}

/// State for one engine run.
struct Run<'a> {
    engine: &'a Engine,
    session: Arc<Session>,
    sink: TunnelSink,
    router: FrameRouter,
    cancel: CancellationToken,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
    tasks: Vec<JoinHandle<()>>,
    guards: Vec<Guard>,
}

impl Run<'_> {
    async fn drive(
        &mut self,
        device: Box<dyn TunDevice>,
        leaf_der: &[u8],
    ) -> Result<(), RunEnd> {
        // SSTP call setup.
        info!("Starting SSTP call setup");
        let request_task = tokio::spawn(
            SstpRequest::new(
                self.router.register_sstp(),
                self.sink.clone(),
                self.session.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            )
            .run(),
        );
        self.await_phases(&[Where::SstpRequest], SSTP_REQUEST_BUDGET)
            .await?;
        let sstp_mailbox = match request_task.await {
            Ok(Some(mailbox)) => mailbox,
            _ => {
                return Err(PhaseFailure::new(
                    Where::SstpRequest,
                    Error::Io("request task lost".into()),
                )
                .into())
            }
        };

        // Link phase.
        info!("Starting LCP negotiation");
        let lcp = Negotiator::new(
            protocols::LCP,
            Where::Lcp,
            LcpPolicy::new(self.session.clone()),
            self.router.register_ppp(protocols::LCP),
            self.sink.clone(),
            self.session.clone(),
            self.control_tx.clone(),
            self.cancel.clone(),
        );
        self.tasks.push(tokio::spawn(lcp.run()));
        self.await_phases(&[Where::Lcp], NEGOTIATION_BUDGET).await?;

        // Authentication phase.
        let auth = self.session.negotiated().auth;
        let auth_budget = Duration::from_secs(self.session.config.ppp.auth_timeout + 5);
        match auth {
            Some(AuthProtocol::Pap) => {
                info!("Authenticating with PAP");
                let task = PapAuthenticator::new(
                    self.router.register_ppp(protocols::PAP),
                    self.sink.clone(),
                    self.session.clone(),
                    self.control_tx.clone(),
                    self.cancel.clone(),
                );
                self.tasks.push(tokio::spawn(task.run()));
                self.await_phases(&[Where::Pap], auth_budget).await?;
            }
            Some(AuthProtocol::Mschapv2) => {
                info!("Authenticating with MS-CHAPv2");
                let task = MschapAuthenticator::new(
                    self.router.register_ppp(protocols::CHAP),
                    self.sink.clone(),
                    self.session.clone(),
                    self.control_tx.clone(),
                    self.cancel.clone(),
                );
                self.tasks.push(tokio::spawn(task.run()));
                self.await_phases(&[Where::Chap], auth_budget).await?;
            }
            Some(AuthProtocol::EapMschapv2) => {
                info!("Authenticating with EAP-MSCHAPv2");
                let task = EapAuthenticator::new(
                    self.router.register_ppp(protocols::EAP),
                    self.sink.clone(),
                    self.session.clone(),
                    self.control_tx.clone(),
                    self.cancel.clone(),
                );
                self.tasks.push(tokio::spawn(task.run()));
                self.await_phases(&[Where::Eap], auth_budget).await?;
            }
            None => debug!("Peer requested no authentication"),
        }

        // A key-producing method must leave its key before Call-Connected.
        if matches!(
            auth,
            Some(AuthProtocol::Mschapv2 | AuthProtocol::EapMschapv2)
        ) && self.session.negotiated().hlak.is_none()
        {
            let at = if auth == Some(AuthProtocol::Mschapv2) {
                Where::Chap
            } else {
                Where::Eap
            };
            return Err(PhaseFailure::new(at, Error::AuthenticationFailed).into());
        }

        // Network phase: enabled families negotiate in parallel.
        info!("Starting network negotiation");
        let ppp_config = &self.session.config.ppp;
        let mut expected = Vec::new();
        if ppp_config.ipv4_enabled {
            let ipcp = Negotiator::new(
                protocols::IPCP,
                Where::Ipcp,
                IpcpPolicy::new(self.session.clone()),
                self.router.register_ppp(protocols::IPCP),
                self.sink.clone(),
                self.session.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            );
            self.tasks.push(tokio::spawn(ipcp.run()));
            expected.push(Where::Ipcp);
        }
        if ppp_config.ipv6_enabled {
            let ipv6cp = Negotiator::new(
                protocols::IPV6CP,
                Where::Ipv6cp,
                Ipv6cpPolicy::new(self.session.clone()),
                self.router.register_ppp(protocols::IPV6CP),
                self.sink.clone(),
                self.session.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            );
            self.tasks.push(tokio::spawn(ipv6cp.run()));
            expected.push(Where::Ipv6cp);
        }
        self.await_phases(&expected, NEGOTIATION_BUDGET).await?;

        // Device setup. Collaborator calls block, so run them aside.
        info!("Configuring virtual device");
        let session = self.session.clone();
        let (reader, writer) = tokio::task::spawn_blocking(move || setup_device(device, &session))
            .await
            .map_err(|_| {
                RunEnd::from(PhaseFailure::new(
                    Where::Tun,
                    Error::Io("device setup panicked".into()),
                ))
            })?
            .map_err(RunEnd::from)?;

        // Call-Connected, then the steady-state control tasks.
        send_call_connected(&self.sink, &self.session, leaf_der)
            .await
            .map_err(RunEnd::from)?;

        let lcp_mailbox = self.router.register_ppp(protocols::LCP);
        self.guards
            .push(self.router.attach_fallback(lcp_mailbox.sender()));
        self.tasks.push(tokio::spawn(
            PppControl::new(
                lcp_mailbox,
                self.sink.clone(),
                self.session.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            )
            .run(),
        ));
        self.tasks.push(tokio::spawn(
            SstpControl::new(
                sstp_mailbox,
                self.sink.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            )
            .run(),
        ));

        // Packet pumps.
        let data_mailbox = self.router.register_data();
        self.tasks.push(tokio::spawn(run_device_writer(
            data_mailbox,
            writer,
            self.cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(
            Mux::new(
                self.sink.clone(),
                self.session.clone(),
                self.control_tx.clone(),
                self.cancel.clone(),
            )
            .run(reader),
        ));

        info!("Tunnel established");
        self.steady_state().await
    }

    /// Wait until every expected layer reports `Proceeded`. Any failure
    /// from anywhere ends the phase immediately.
    async fn await_phases(
        &mut self,
        expected: &[Where],
        budget: Duration,
    ) -> Result<(), RunEnd> {
        let deadline = tokio::time::Instant::now() + budget;
        let mut pending: HashSet<Where> = expected.iter().copied().collect();

        while !pending.is_empty() {
            let message = tokio::select! {
                _ = self.engine.shutdown.cancelled() => return Err(RunEnd::Shutdown),
                message = tokio::time::timeout_at(deadline, self.control_rx.recv()) => {
                    match message {
                        Err(_) => {
                            let at = pending.iter().next().copied().unwrap_or(Where::Demux);
                            return Err(PhaseFailure::new(at, Error::Timeout).into());
                        }
                        Ok(None) => {
                            return Err(PhaseFailure::new(
                                Where::Demux,
                                Error::Io("control channel closed".into()),
                            )
                            .into())
                        }
                        Ok(Some(message)) => message,
                    }
                }
            };

            match message.outcome {
                Outcome::Proceeded => {
                    debug!(from = %message.from, "Phase proceeded");
                    pending.remove(&message.from);
                }
                Outcome::Failed(error) => {
                    return Err(PhaseFailure::new(message.from, error).into());
                }
            }
        }
        Ok(())
    }

    /// Connected: wait for a failure or a host shutdown.
    async fn steady_state(&mut self) -> Result<(), RunEnd> {
        loop {
            tokio::select! {
                _ = self.engine.shutdown.cancelled() => return Err(RunEnd::Shutdown),
                message = self.control_rx.recv() => match message {
                    Some(message) => match message.outcome {
                        Outcome::Proceeded => continue,
                        Outcome::Failed(error) => {
                            return Err(PhaseFailure::new(message.from, error).into())
                        }
                    },
                    None => {
                        return Err(PhaseFailure::new(
                            Where::Demux,
                            Error::Io("control channel closed".into()),
                        )
                        .into())
                    }
                },
            }
        }
    }
}

/// Apply negotiated values to the device and bring it up.
fn setup_device(
    device: Box<dyn TunDevice>,
    session: &Session,
) -> Result<(Box<dyn TunReader>, Box<dyn TunWriter>), PhaseFailure> {
    let mut device = device;
    let config = &session.config;
    let negotiated = session.negotiated().clone();
    let tun_err = |e: std::io::Error| PhaseFailure::new(Where::Tun, Error::from(e));

    if config.ppp.ipv4_enabled {
        if negotiated.ipv4.is_unspecified() {
            return Err(PhaseFailure::new(Where::Tun, Error::InvalidAddress));
        }
        device
            .add_address(IpAddr::V4(negotiated.ipv4), 32)
            .map_err(tun_err)?;
        info!(address = %negotiated.ipv4, "IPv4 address assigned");
    }

    if config.ppp.ipv6_enabled {
        if negotiated.ipv6_interface_id == [0u8; 8] {
            return Err(PhaseFailure::new(Where::Tun, Error::InvalidAddress));
        }
        let addr = link_local(negotiated.ipv6_interface_id);
        device
            .add_address(IpAddr::V6(addr), 64)
            .map_err(tun_err)?;
        info!(address = %addr, "IPv6 link-local address assigned");
    }

    if config.dns.use_custom_server {
        if let Some(addr) = config.dns.custom_address {
            device.add_dns_server(IpAddr::V4(addr)).map_err(tun_err)?;
        }
    } else if config.dns.request_address && !negotiated.proposed_dns.is_unspecified() {
        device
            .add_dns_server(IpAddr::V4(negotiated.proposed_dns))
            .map_err(tun_err)?;
    }

    let routes =
        route::collect_routes(config).map_err(|e| PhaseFailure::new(Where::Route, e))?;
    for cidr in &routes {
        device.add_route(cidr).map_err(tun_err)?;
    }

    if config.routes.enable_app_based_rule {
        for app in &config.routes.allowed_apps {
            device.add_allowed_application(app).map_err(tun_err)?;
        }
    }

    device.set_mtu(config.ppp.mtu).map_err(tun_err)?;
    device.establish().map_err(tun_err)
}

/// Link-local address from a negotiated interface identifier.
fn link_local(interface_id: [u8; 8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xFE;
    octets[1] = 0x80;
    octets[8..].copy_from_slice(&interface_id);
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_local_layout() {
        let addr = link_local([0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            addr.octets(),
            [0xFE, 0x80, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7]
        );
    }
}
