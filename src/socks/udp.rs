//! UDP relay backing the SOCKS5 UDP ASSOCIATE command.
//!
//! Datagrams arrive SOCKS-framed (`RSV FRAG ATYP DST.ADDR DST.PORT DATA`) on
//! a loopback socket; each (client, destination) pair gets one outbound
//! session. Inbound datagrams are re-wrapped with the original destination
//! header before going back to the client.

use super::{SocksConnector, SocksDatagram};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 64 * 1024;

pub(super) struct UdpRelay {
    port: u16,
    relay_task: JoinHandle<()>,
    session_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl UdpRelay {
    pub(super) async fn start(connector: Arc<dyn SocksConnector>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?);
        let port = socket.local_addr()?.port();
        let session_tasks = Arc::new(Mutex::new(Vec::new()));
        let relay_task = tokio::spawn(relay_loop(
            socket,
            connector,
            Arc::clone(&session_tasks),
        ));
        Ok(Self {
            port,
            relay_task,
            session_tasks,
        })
    }

    pub(super) fn port(&self) -> u16 {
        self.port
    }

    pub(super) fn stop(&self) {
        self.relay_task.abort();
        for task in self.session_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DecodedDatagram<'a> {
    /// `RSV FRAG ATYP DST.ADDR DST.PORT`, kept verbatim for re-wrapping.
    header: &'a [u8],
    host: String,
    port: u16,
    payload: &'a [u8],
}

fn decode_datagram(datagram: &[u8]) -> Option<DecodedDatagram<'_>> {
    if datagram.len() < 4 {
        return None;
    }
    // RSV must be zero and fragmentation is unsupported.
    if datagram[0] != 0 || datagram[1] != 0 || datagram[2] != 0 {
        return None;
    }
    let atyp = datagram[3];
    let (host, addr_end) = match atyp {
        super::ATYP_IPV4 => {
            if datagram.len() < 4 + 4 + 2 {
                return None;
            }
            let octets: [u8; 4] = datagram[4..8].try_into().ok()?;
            (Ipv4Addr::from(octets).to_string(), 8)
        }
        super::ATYP_DOMAIN => {
            let len = *datagram.get(4)? as usize;
            if len == 0 || datagram.len() < 5 + len + 2 {
                return None;
            }
            let domain = std::str::from_utf8(&datagram[5..5 + len]).ok()?;
            (domain.to_string(), 5 + len)
        }
        super::ATYP_IPV6 => {
            if datagram.len() < 4 + 16 + 2 {
                return None;
            }
            let octets: [u8; 16] = datagram[4..20].try_into().ok()?;
            (std::net::Ipv6Addr::from(octets).to_string(), 20)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([datagram[addr_end], datagram[addr_end + 1]]);
    Some(DecodedDatagram {
        header: &datagram[..addr_end + 2],
        host,
        port,
        payload: &datagram[addr_end + 2..],
    })
}

async fn relay_loop(
    socket: Arc<UdpSocket>,
    connector: Arc<dyn SocksConnector>,
    session_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let mut sessions: HashMap<(SocketAddr, String, u16), Arc<dyn SocksDatagram>> = HashMap::new();
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, client) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Some(decoded) = decode_datagram(&buffer[..len]) else {
            continue;
        };
        let key = (client, decoded.host.clone(), decoded.port);
        if !sessions.contains_key(&key) {
            let session = match connector.udp_connect(&decoded.host, decoded.port).await {
                Ok(session) => session,
                Err(_) => continue,
            };
            let reader = tokio::spawn(pump_inbound(
                Arc::clone(&session),
                Arc::clone(&socket),
                client,
                decoded.header.to_vec(),
            ));
            session_tasks.lock().push(reader);
            sessions.insert(key.clone(), session);
        }
        if let Some(session) = sessions.get(&key) {
            let _ = session.send(decoded.payload).await;
        }
    }
}

/// Pipes remote datagrams back to the client, framed with the original
/// destination header.
async fn pump_inbound(
    session: Arc<dyn SocksDatagram>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    header: Vec<u8>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    loop {
        let len = match session.recv(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(len) => len,
        };
        let mut framed = Vec::with_capacity(header.len() + len);
        framed.extend_from_slice(&header);
        framed.extend_from_slice(&buffer[..len]);
        if socket.send_to(&framed, client).await.is_err() {
            break;
        }
    }
}
