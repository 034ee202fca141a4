//! End-to-end call-setup scenarios over an in-memory transport.
//!
//! A scripted fake server drives the engine through SSTP call setup,
//! LCP, authentication and IPCP, then checks the crypto-bound
//! Call-Connected packet byte for byte.

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use sstpc::codec::ppp::{codes, protocols, PppPacket, RawOption};
use sstpc::codec::sstp::{Attribute, ControlPacket, CryptoBindingRequest, MessageType};
use sstpc::config::{AuthProtocol, Config, PppConfig};
use sstpc::crypto::HashProtocol;
use sstpc::device::{EmptyTrustStore, NullReporter, TunDevice, TunReader, TunWriter};
use sstpc::engine::Engine;
use sstpc::error::Error;
use sstpc::session::Session;
use sstpc::sstp::binding;
use sstpc::transport::{Established, TunnelStream};
use sstpc::{Terminal, Where};

const LEAF_DER: &[u8] = b"not-really-a-certificate";

fn base_config() -> Config {
    Config {
        hostname: "vpn.example.com".into(),
        port: 443,
        username: "u".into(),
        password: "p".into(),
        proxy: None,
        tls: Default::default(),
        ppp: PppConfig {
            auth_protocols: vec![AuthProtocol::Pap],
            ..PppConfig::default()
        },
        dns: Default::default(),
        routes: Default::default(),
        reconnect: Default::default(),
    }
}

/// Call log shared with the fake device.
#[derive(Clone, Default)]
struct DeviceLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl DeviceLog {
    fn push(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn snapshot(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct FakeDevice {
    log: DeviceLog,
    reader_rx: std::sync::mpsc::Receiver<Vec<u8>>,
}

impl FakeDevice {
    fn new(log: DeviceLog) -> (Self, std::sync::mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            Self {
                log,
                reader_rx: rx,
            },
            tx,
        )
    }
}

impl TunDevice for FakeDevice {
    fn add_address(&mut self, addr: IpAddr, prefix: u8) -> io::Result<()> {
        self.log.push(format!("addr {addr}/{prefix}"));
        Ok(())
    }

    fn add_dns_server(&mut self, addr: IpAddr) -> io::Result<()> {
        self.log.push(format!("dns {addr}"));
        Ok(())
    }

    fn add_route(&mut self, cidr: &str) -> io::Result<()> {
        self.log.push(format!("route {cidr}"));
        Ok(())
    }

    fn add_allowed_application(&mut self, id: &str) -> io::Result<()> {
        self.log.push(format!("app {id}"));
        Ok(())
    }

    fn set_mtu(&mut self, mtu: u16) -> io::Result<()> {
        self.log.push(format!("mtu {mtu}"));
        Ok(())
    }

    fn establish(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)> {
        let this = *self;
        this.log.push("establish".into());
        Ok((
            Box::new(FakeReader {
                rx: this.reader_rx,
            }),
            Box::new(FakeWriter { log: this.log }),
        ))
    }
}

struct FakeReader {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
}

impl TunReader for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv() {
            Ok(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }
}

struct FakeWriter {
    log: DeviceLog,
}

impl TunWriter for FakeWriter {
    fn write(&mut self, buf: &[u8], off: usize, len: usize) -> io::Result<()> {
        self.log.push(format!("write {:02X?}", &buf[off..off + len]));
        Ok(())
    }
}

/// Read one complete SSTP packet from the fake server's stream.
async fn read_packet(stream: &mut DuplexStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut packet = vec![0u8; total];
    packet[..4].copy_from_slice(&header);
    stream.read_exact(&mut packet[4..]).await.unwrap();
    packet
}

/// Read one SSTP DATA packet and parse its PPP frame.
async fn read_ppp(stream: &mut DuplexStream) -> PppPacket {
    let packet = read_packet(stream).await;
    assert_eq!(&packet[..2], &[0x10, 0x00], "expected a DATA packet");
    PppPacket::parse(&packet[4..]).unwrap()
}

async fn send_ppp(stream: &mut DuplexStream, packet: &PppPacket) {
    stream.write_all(&packet.write_data_packet()).await.unwrap();
}

async fn send_control(stream: &mut DuplexStream, packet: &ControlPacket) {
    stream.write_all(&packet.write()).await.unwrap();
}

fn start_engine(
    config: Config,
    device: Box<dyn TunDevice>,
) -> (DuplexStream, tokio::task::JoinHandle<Terminal>) {
    let config = Arc::new(config);
    let session = Session::new(config.clone());
    let engine = Engine::new(config, Arc::new(EmptyTrustStore), Arc::new(NullReporter));

    let (client, server) = tokio::io::duplex(64 * 1024);
    let stream: Box<dyn TunnelStream> = Box::new(client);
    let established = Established {
        stream,
        leaf_der: LEAF_DER.to_vec(),
    };

    let handle = tokio::spawn(async move { engine.run_on(session, established, device).await });
    (server, handle)
}

#[tokio::test]
async fn full_pap_session_with_crypto_binding() {
    let mut config = base_config();
    config.routes.add_custom_routes = true;
    config.routes.custom_routes = "192.168.1.0/24\n2001:db8::/32".into();

    let log = DeviceLog::default();
    let (device, _tun_tx) = FakeDevice::new(log.clone());
    let (mut server, engine) = start_engine(config, Box::new(device));

    let nonce = [0xA5u8; 32];

    // Call setup: the request must be the canonical 14 bytes.
    let request = read_packet(&mut server).await;
    assert_eq!(request, ControlPacket::call_connect_request().write());
    send_control(
        &mut server,
        &ControlPacket::with_attributes(
            MessageType::CallConnectAck,
            vec![Attribute::CryptoBindingRequest(CryptoBindingRequest {
                hash_bitmask: 0x02,
                nonce,
            })],
        ),
    )
    .await;

    // LCP: ack the client's request, get ours acked with PAP auth.
    let client_req = read_ppp(&mut server).await;
    assert_eq!(client_req.protocol, protocols::LCP);
    assert_eq!(client_req.code, codes::CONFIGURE_REQUEST);

    let server_req = PppPacket::with_options(
        protocols::LCP,
        codes::CONFIGURE_REQUEST,
        77,
        &[RawOption::new(3, vec![0xC0, 0x23])],
    );
    send_ppp(&mut server, &server_req).await;
    send_ppp(
        &mut server,
        &PppPacket::new(
            protocols::LCP,
            codes::CONFIGURE_ACK,
            client_req.id,
            client_req.payload.clone(),
        ),
    )
    .await;

    let ack = read_ppp(&mut server).await;
    assert_eq!(ack.code, codes::CONFIGURE_ACK);
    assert_eq!(ack.id, 77);

    // PAP with the configured credentials.
    let pap = read_ppp(&mut server).await;
    assert_eq!(pap.protocol, protocols::PAP);
    assert_eq!(pap.code, 1);
    assert_eq!(pap.payload, vec![1, b'u', 1, b'p']);
    send_ppp(
        &mut server,
        &PppPacket::new(protocols::PAP, 2, pap.id, Vec::new()),
    )
    .await;

    // IPCP: nak the zero address with a real one, then converge.
    let ipcp_req = read_ppp(&mut server).await;
    assert_eq!(ipcp_req.protocol, protocols::IPCP);
    let options = ipcp_req.options().unwrap();
    assert_eq!(options[0].data, vec![0, 0, 0, 0]);
    send_ppp(
        &mut server,
        &PppPacket::with_options(
            protocols::IPCP,
            codes::CONFIGURE_NAK,
            ipcp_req.id,
            &[RawOption::new(3, vec![192, 0, 2, 10])],
        ),
    )
    .await;

    let retry = read_ppp(&mut server).await;
    assert_eq!(retry.options().unwrap()[0].data, vec![192, 0, 2, 10]);

    let server_ipcp = PppPacket::with_options(
        protocols::IPCP,
        codes::CONFIGURE_REQUEST,
        88,
        &[RawOption::new(3, vec![192, 0, 2, 1])],
    );
    send_ppp(&mut server, &server_ipcp).await;
    send_ppp(
        &mut server,
        &PppPacket::new(
            protocols::IPCP,
            codes::CONFIGURE_ACK,
            retry.id,
            retry.payload.clone(),
        ),
    )
    .await;

    let ipcp_ack = read_ppp(&mut server).await;
    assert_eq!(ipcp_ack.code, codes::CONFIGURE_ACK);
    assert_eq!(ipcp_ack.id, 88);

    // Call-Connected must carry the exact crypto binding: PAP leaves a
    // zero HLAK, the bitmask chose SHA-256.
    let connected = read_packet(&mut server).await;
    let cert_hash: [u8; 32] = Sha256::digest(LEAF_DER).into();
    let expected =
        binding::build_call_connected(HashProtocol::Sha256, &[0u8; 32], nonce, cert_hash);
    assert_eq!(connected, expected);

    // Steady state: echoes are answered.
    send_control(&mut server, &ControlPacket::bare(MessageType::EchoRequest)).await;
    let echo = read_packet(&mut server).await;
    assert_eq!(
        ControlPacket::parse(&echo).unwrap().message_type,
        MessageType::EchoResponse
    );

    // Peer disconnect ends the run.
    send_control(&mut server, &ControlPacket::bare(MessageType::CallDisconnect)).await;
    let terminal = engine.await.unwrap();
    assert_eq!(terminal.from, Where::SstpControl);
    assert_eq!(terminal.error, Some(Error::DisconnectRequested));

    // Device saw the negotiated address, both custom routes in order,
    // the MTU, and establish.
    let calls = log.snapshot();
    assert_eq!(calls[0], "addr 192.0.2.10/32");
    assert_eq!(calls[1], "route 192.168.1.0/24");
    assert_eq!(calls[2], "route 2001:db8::/32");
    assert_eq!(calls[3], "mtu 1500");
    assert_eq!(calls[4], "establish");
}

#[tokio::test]
async fn lcp_mru_reject_with_small_config_is_fatal() {
    let mut config = base_config();
    config.ppp.mru = 1400;
    config.ppp.mtu = 1400;

    let log = DeviceLog::default();
    let (device, _tun_tx) = FakeDevice::new(log.clone());
    let (mut server, engine) = start_engine(config, Box::new(device));

    let _request = read_packet(&mut server).await;
    send_control(
        &mut server,
        &ControlPacket::with_attributes(
            MessageType::CallConnectAck,
            vec![Attribute::CryptoBindingRequest(CryptoBindingRequest {
                hash_bitmask: 0x02,
                nonce: [0u8; 32],
            })],
        ),
    )
    .await;

    let client_req = read_ppp(&mut server).await;
    let options = client_req.options().unwrap();
    let mru = options.iter().find(|o| o.kind == 1).unwrap().clone();
    assert_eq!(mru.as_u16().unwrap(), 1400);

    send_ppp(
        &mut server,
        &PppPacket::with_options(
            protocols::LCP,
            codes::CONFIGURE_REJECT,
            client_req.id,
            &[mru],
        ),
    )
    .await;

    let terminal = engine.await.unwrap();
    assert_eq!(terminal.from, Where::LcpMru);
    assert_eq!(terminal.error, Some(Error::OptionRejected));

    // Teardown never reached the device.
    assert!(log.snapshot().is_empty());
}

#[tokio::test]
async fn static_address_nak_is_fatal() {
    let mut config = base_config();
    config.ppp.request_static_ipv4 = true;
    config.ppp.static_ipv4 = Some("10.0.0.5".parse().unwrap());

    let log = DeviceLog::default();
    let (device, _tun_tx) = FakeDevice::new(log.clone());
    let (mut server, engine) = start_engine(config, Box::new(device));

    let _request = read_packet(&mut server).await;
    send_control(
        &mut server,
        &ControlPacket::with_attributes(
            MessageType::CallConnectAck,
            vec![Attribute::CryptoBindingRequest(CryptoBindingRequest {
                hash_bitmask: 0x02,
                nonce: [0u8; 32],
            })],
        ),
    )
    .await;

    // Plain LCP: accept the client's request, send none of our own
    // needs; one request of ours with PAP, acked.
    let client_req = read_ppp(&mut server).await;
    send_ppp(
        &mut server,
        &PppPacket::with_options(
            protocols::LCP,
            codes::CONFIGURE_REQUEST,
            50,
            &[RawOption::new(3, vec![0xC0, 0x23])],
        ),
    )
    .await;
    send_ppp(
        &mut server,
        &PppPacket::new(
            protocols::LCP,
            codes::CONFIGURE_ACK,
            client_req.id,
            client_req.payload.clone(),
        ),
    )
    .await;
    let _ack = read_ppp(&mut server).await;

    let pap = read_ppp(&mut server).await;
    send_ppp(
        &mut server,
        &PppPacket::new(protocols::PAP, 2, pap.id, Vec::new()),
    )
    .await;

    // The request carries the static address; nak it.
    let ipcp_req = read_ppp(&mut server).await;
    assert_eq!(ipcp_req.options().unwrap()[0].data, vec![10, 0, 0, 5]);
    send_ppp(
        &mut server,
        &PppPacket::with_options(
            protocols::IPCP,
            codes::CONFIGURE_NAK,
            ipcp_req.id,
            &[RawOption::new(3, vec![192, 0, 2, 10])],
        ),
    )
    .await;

    let terminal = engine.await.unwrap();
    assert_eq!(terminal.from, Where::Ipcp);
    assert_eq!(terminal.error, Some(Error::AddressRejected));
}

#[tokio::test]
async fn undersized_length_field_is_fatal() {
    let log = DeviceLog::default();
    let (device, _tun_tx) = FakeDevice::new(log.clone());
    let (mut server, engine) = start_engine(base_config(), Box::new(device));

    let _request = read_packet(&mut server).await;
    // Length field below the header size.
    server.write_all(&[0x10, 0x01, 0x00, 0x03]).await.unwrap();

    let terminal = engine.await.unwrap();
    assert_eq!(terminal.from, Where::Demux);
    assert_eq!(terminal.error, Some(Error::InvalidPacketSize(3)));
}

#[tokio::test]
async fn call_connect_nak_is_fatal() {
    let log = DeviceLog::default();
    let (device, _tun_tx) = FakeDevice::new(log.clone());
    let (mut server, engine) = start_engine(base_config(), Box::new(device));

    let _request = read_packet(&mut server).await;
    send_control(&mut server, &ControlPacket::bare(MessageType::CallConnectNak)).await;

    let terminal = engine.await.unwrap();
    assert_eq!(terminal.from, Where::SstpRequest);
    assert_eq!(terminal.error, Some(Error::NegativeAcknowledged));
}
