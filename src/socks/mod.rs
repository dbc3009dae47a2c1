//! SOCKS5 (RFC 1928) server: the engine's alternate egress mode.
//!
//! A loopback listener speaks the no-auth handshake and hands CONNECT, BIND,
//! and UDP ASSOCIATE to a pluggable connector. Each accepted connection runs
//! an independent state machine on its own task; relay buffers are capped so
//! one connection cannot balloon memory.

mod udp;

use crate::logger::{self, BreadcrumbFlags};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

pub const SOCKS_VERSION: u8 = 5;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_UNACCEPTABLE: u8 = 0xFF;
/// Hard cap on per-connection input buffering; exceeding it aborts the
/// connection.
pub const INPUT_BUFFER_CAP: usize = 64 * 1024;
pub const MAX_DOMAIN_LEN: usize = 255;

/// Chunk size for relay reads and writes.
const RELAY_CHUNK: usize = 8 * 1024;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Destination requested by a SOCKS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddress {
    Ipv4(Ipv4Addr),
    Ipv6(std::net::Ipv6Addr),
    Domain(String),
}

impl SocksAddress {
    pub fn host_string(&self) -> String {
        match self {
            SocksAddress::Ipv4(addr) => addr.to_string(),
            SocksAddress::Ipv6(addr) => addr.to_string(),
            SocksAddress::Domain(domain) => domain.clone(),
        }
    }
}

pub trait SocksStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SocksStream for T {}

/// Listening socket opened for a BIND command.
#[async_trait]
pub trait SocksBind: Send {
    fn local_addr(&self) -> SocketAddr;
    async fn accept(self: Box<Self>) -> io::Result<(Box<dyn SocksStream>, SocketAddr)>;
}

/// Connected datagram session opened for UDP ASSOCIATE traffic.
#[async_trait]
pub trait SocksDatagram: Send + Sync {
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize>;
}

/// Egress factory behind the SOCKS server.
#[async_trait]
pub trait SocksConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn SocksStream>>;
    async fn bind(&self) -> io::Result<Box<dyn SocksBind>>;
    async fn udp_connect(&self, host: &str, port: u16) -> io::Result<Arc<dyn SocksDatagram>>;
}

/// Connector backed by plain host sockets.
pub struct DirectConnector;

struct DirectBind {
    listener: TcpListener,
    local: SocketAddr,
}

#[async_trait]
impl SocksBind for DirectBind {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn accept(self: Box<Self>) -> io::Result<(Box<dyn SocksStream>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream), peer))
    }
}

struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl SocksDatagram for DirectDatagram {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload).await
    }

    async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buffer).await
    }
}

#[async_trait]
impl SocksConnector for DirectConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn SocksStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }

    async fn bind(&self) -> io::Result<Box<dyn SocksBind>> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let local = listener.local_addr()?;
        Ok(Box::new(DirectBind { listener, local }))
    }

    async fn udp_connect(&self, host: &str, port: u16) -> io::Result<Arc<dyn SocksDatagram>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect((host, port)).await?;
        Ok(Arc::new(DirectDatagram { socket }))
    }
}

enum ServerState {
    Idle,
    /// A start is binding; the generation detects a stop racing it.
    Starting(u64),
    Running { port: u16, accept_task: JoinHandle<()> },
}

pub struct Socks5Server {
    connector: Arc<dyn SocksConnector>,
    state: Arc<Mutex<ServerState>>,
    generation: Mutex<u64>,
}

impl Socks5Server {
    pub fn new(connector: Arc<dyn SocksConnector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(ServerState::Idle)),
            generation: Mutex::new(0),
        }
    }

    /// Binds the loopback listener. A busy `port` falls back to an
    /// OS-assigned one. Idempotent: a running server returns its bound port.
    pub async fn start(&self, port: u16) -> io::Result<u16> {
        let generation = {
            let mut state = self.state.lock();
            match &*state {
                ServerState::Running { port, .. } => return Ok(*port),
                ServerState::Starting(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "start already in progress",
                    ))
                }
                ServerState::Idle => {}
            }
            let mut generation = self.generation.lock();
            *generation += 1;
            *state = ServerState::Starting(*generation);
            *generation
        };

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => listener,
            Err(error) if error.kind() == io::ErrorKind::AddrInUse && port != 0 => {
                logger::breadcrumb(
                    BreadcrumbFlags::SOCKS,
                    format!("port {port} busy, retrying with an ephemeral port"),
                );
                TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?
            }
            Err(error) => {
                *self.state.lock() = ServerState::Idle;
                return Err(error);
            }
        };
        let bound_port = listener.local_addr()?.port();

        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ServerState::Idle) {
            ServerState::Starting(current) if current == generation => {
                let connector = Arc::clone(&self.connector);
                let accept_task = tokio::spawn(accept_loop(listener, connector));
                *state = ServerState::Running {
                    port: bound_port,
                    accept_task,
                };
                logger::info(format!("SOCKS5 server listening on 127.0.0.1:{bound_port}"));
                Ok(bound_port)
            }
            // A stop raced the bind; do not come up afterwards.
            ServerState::Idle => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "server stopped during start",
            )),
            other => {
                *state = other;
                Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "superseded start",
                ))
            }
        }
    }

    /// Cancels any in-flight start and closes the listener. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ServerState::Idle) {
            ServerState::Running { accept_task, port } => {
                accept_task.abort();
                logger::info(format!("SOCKS5 server on port {port} stopped"));
            }
            ServerState::Starting(_) | ServerState::Idle => {}
        }
    }

    pub fn bound_port(&self) -> Option<u16> {
        match &*self.state.lock() {
            ServerState::Running { port, .. } => Some(*port),
            _ => None,
        }
    }
}

impl Drop for Socks5Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, connector: Arc<dyn SocksConnector>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let connector = Arc::clone(&connector);
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(stream, connector).await {
                        logger::breadcrumb(
                            BreadcrumbFlags::SOCKS,
                            format!("connection from {peer} ended: {error}"),
                        );
                    }
                });
            }
            Err(error) => {
                logger::warn(format!("SOCKS5 accept failed: {error}"));
                break;
            }
        }
    }
}

/// Greeting -> method select -> request -> command dispatch.
async fn serve_connection(
    mut stream: TcpStream,
    connector: Arc<dyn SocksConnector>,
) -> io::Result<()> {
    let version = stream.read_u8().await?;
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;
    if version != SOCKS_VERSION || !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
            .await?;
        return Ok(());
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        write_reply(&mut stream, REP_GENERAL_FAILURE, None, 0).await?;
        return Ok(());
    }
    let command = head[1];
    let address = match read_address(&mut stream, head[3]).await {
        Ok(address) => address,
        Err(error) if error.kind() == io::ErrorKind::Unsupported => {
            write_reply(&mut stream, REP_ADDRESS_NOT_SUPPORTED, None, 0).await?;
            return Ok(());
        }
        Err(error) => return Err(error),
    };
    let port = stream.read_u16().await?;

    match command {
        CMD_CONNECT => handle_connect(stream, connector, address, port).await,
        CMD_BIND => handle_bind(stream, connector).await,
        CMD_UDP_ASSOCIATE => handle_udp_associate(stream, connector).await,
        _ => {
            write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, None, 0).await?;
            Ok(())
        }
    }
}

async fn read_address(stream: &mut TcpStream, atyp: u8) -> io::Result<SocksAddress> {
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ok(SocksAddress::Ipv4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ok(SocksAddress::Ipv6(std::net::Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 || len > MAX_DOMAIN_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "bad domain length",
                ));
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map(SocksAddress::Domain)
                .map_err(|_| io::Error::new(io::ErrorKind::Unsupported, "domain not UTF-8"))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unknown address type",
        )),
    }
}

/// `VER REP RSV ATYP=1 BND.ADDR BND.PORT`; non-IPv4 binds degrade to 0.0.0.0.
async fn write_reply(
    stream: &mut (impl AsyncWrite + Unpin),
    rep: u8,
    bind_addr: Option<SocketAddr>,
    bind_port: u16,
) -> io::Result<()> {
    let addr = match bind_addr {
        Some(SocketAddr::V4(v4)) => *v4.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    };
    let mut reply = [0u8; 10];
    reply[0] = SOCKS_VERSION;
    reply[1] = rep;
    reply[3] = ATYP_IPV4;
    reply[4..8].copy_from_slice(&addr.octets());
    reply[8..10].copy_from_slice(&bind_port.to_be_bytes());
    stream.write_all(&reply).await
}

fn reply_code_for(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::NotFound | io::ErrorKind::TimedOut => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    connector: Arc<dyn SocksConnector>,
    address: SocksAddress,
    port: u16,
) -> io::Result<()> {
    let host = address.host_string();
    logger::breadcrumb(BreadcrumbFlags::SOCKS, format!("CONNECT {host}:{port}"));
    let outbound = match connector.connect(&host, port).await {
        Ok(outbound) => outbound,
        Err(error) => {
            write_reply(&mut stream, reply_code_for(&error), None, 0).await?;
            return Ok(());
        }
    };
    let local = stream.local_addr().ok();
    write_reply(&mut stream, REP_SUCCESS, local, 0).await?;
    relay_streams(&mut stream, outbound).await
}

async fn handle_bind(mut stream: TcpStream, connector: Arc<dyn SocksConnector>) -> io::Result<()> {
    let bind = match connector.bind().await {
        Ok(bind) => bind,
        Err(error) => {
            write_reply(&mut stream, reply_code_for(&error), None, 0).await?;
            return Ok(());
        }
    };
    let local = bind.local_addr();
    logger::breadcrumb(BreadcrumbFlags::SOCKS, format!("BIND on {local}"));
    // First reply announces the bind address; the second fires on accept.
    write_reply(&mut stream, REP_SUCCESS, Some(local), local.port()).await?;
    let (peer_stream, peer) = match bind.accept().await {
        Ok(accepted) => accepted,
        Err(error) => {
            write_reply(&mut stream, reply_code_for(&error), None, 0).await?;
            return Ok(());
        }
    };
    write_reply(&mut stream, REP_SUCCESS, Some(peer), peer.port()).await?;
    relay_streams(&mut stream, peer_stream).await
}

async fn handle_udp_associate(
    mut stream: TcpStream,
    connector: Arc<dyn SocksConnector>,
) -> io::Result<()> {
    let relay = match udp::UdpRelay::start(connector).await {
        Ok(relay) => relay,
        Err(error) => {
            write_reply(&mut stream, reply_code_for(&error), None, 0).await?;
            return Ok(());
        }
    };
    logger::breadcrumb(
        BreadcrumbFlags::SOCKS,
        format!("UDP ASSOCIATE relay on {}", relay.port()),
    );
    write_reply(
        &mut stream,
        REP_SUCCESS,
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), relay.port())),
        relay.port(),
    )
    .await?;

    // The association lives as long as the controlling TCP connection.
    let mut drain = [0u8; 512];
    loop {
        match stream.read(&mut drain).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    relay.stop();
    Ok(())
}

/// Pipes both directions until EOF or error; either outcome drops both
/// halves with a normal FIN.
///
/// Client input may back up while the outbound side stalls, but only up to
/// `INPUT_BUFFER_CAP`; crossing the cap aborts the connection.
async fn relay_streams(client: &mut TcpStream, outbound: Box<dyn SocksStream>) -> io::Result<()> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(outbound);

    let upstream = async {
        let mut chunk = vec![0u8; RELAY_CHUNK];
        let mut backlog: VecDeque<u8> = VecDeque::new();
        let mut relayed = 0u64;
        let mut client_done = false;
        loop {
            if backlog.is_empty() {
                if client_done {
                    remote_write.shutdown().await?;
                    return Ok::<u64, io::Error>(relayed);
                }
                let read = client_read.read(&mut chunk).await?;
                if read == 0 {
                    client_done = true;
                } else {
                    backlog.extend(&chunk[..read]);
                }
                continue;
            }
            // Copy the front slice out so the read handler below may grow
            // the backlog while a write is in flight.
            let (front, _) = backlog.as_slices();
            let to_write = front[..front.len().min(RELAY_CHUNK)].to_vec();
            tokio::select! {
                read = client_read.read(&mut chunk), if !client_done => {
                    let read = read?;
                    if read == 0 {
                        client_done = true;
                    } else if backlog.len() + read > INPUT_BUFFER_CAP {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            "per-connection input buffer cap exceeded",
                        ));
                    } else {
                        backlog.extend(&chunk[..read]);
                    }
                }
                written = remote_write.write(&to_write) => {
                    let written = written?;
                    if written == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    backlog.drain(..written);
                    relayed += written as u64;
                }
            }
        }
    };

    let downstream = async {
        let mut chunk = vec![0u8; RELAY_CHUNK];
        let mut relayed = 0u64;
        loop {
            let read = remote_read.read(&mut chunk).await?;
            if read == 0 {
                client_write.shutdown().await?;
                return Ok::<u64, io::Error>(relayed);
            }
            client_write.write_all(&chunk[..read]).await?;
            relayed += read as u64;
        }
    };

    let (up, down) = tokio::try_join!(upstream, downstream)?;
    logger::breadcrumb(
        BreadcrumbFlags::SOCKS,
        format!("relay finished (up={up}B down={down}B)"),
    );
    Ok(())
}
