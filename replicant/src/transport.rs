//! The messaging collaborator:  a reliable-when-connected, message-oriented transport with
//! per-peer identification by 64-bit id, a runtime-mutable address book, and explicit
//! [Error::Disrupted] delivery failures.  The daemon drives it from one receive loop; sends are
//! thread-safe.
//!
//! Two implementations live here.  [TcpTransport] frames messages over TCP the way
//! `split_channel` does (a one-byte frame-size prefix, a `Frame { size, crc32c }`, then the
//! payload), with the sender's id leading every payload and ephemeral ids minted for anonymous
//! clients.  [inproc::Mesh] wires endpoints together with channels inside one process, for tests
//! and single-process clusters.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biometrics::{Collector, Counter};

use buffertk::{stack_pack, Unpackable};

use indicio::{clue, WARNING};

use rpc_pb::Frame;

use replicant_pb::{NetworkMessage, Server, ServerId};

use super::{Error, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES_SENT: Counter = Counter::new("replicant.transport.messages_sent");
static MESSAGES_RECV: Counter = Counter::new("replicant.transport.messages_recv");
static SEND_DISRUPTED: Counter = Counter::new("replicant.transport.send_disrupted");
static CONNECTIONS_ACCEPTED: Counter = Counter::new("replicant.transport.connections_accepted");
static CONNECTIONS_OPENED: Counter = Counter::new("replicant.transport.connections_opened");
static CORRUPT_FRAMES: Counter = Counter::new("replicant.transport.corrupt_frames");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MESSAGES_SENT);
    collector.register_counter(&MESSAGES_RECV);
    collector.register_counter(&SEND_DISRUPTED);
    collector.register_counter(&CONNECTIONS_ACCEPTED);
    collector.register_counter(&CONNECTIONS_OPENED);
    collector.register_counter(&CORRUPT_FRAMES);
}

///////////////////////////////////////////// Transport ////////////////////////////////////////////

pub trait Transport: Send + Sync {
    /// Our identity on this transport.
    fn us(&self) -> ServerId;

    /// Fire-and-forget delivery.  Sending to our own id loops back into [Transport::recv].
    /// [Error::Disrupted] means the peer is unreachable right now; the caller tolerates it.
    fn send(&self, to: ServerId, msg: &NetworkMessage) -> Result<(), Error>;

    /// Receive the next message, or None when `timeout` elapses.  Main-thread affine.
    fn recv(&self, timeout: Duration) -> Result<Option<(ServerId, NetworkMessage)>, Error>;

    /// Install the address book of the active configuration.  Clears auxiliary addresses.
    fn set_servers(&self, servers: &[Server]);

    /// Add or correct one peer's address outside the configured set.
    fn add_aux(&self, server: &Server);

    /// One-shot RPC by address:  connect anonymously, send, await a single reply.  Used by
    /// bootstrap, join, and state-transfer exchanges.
    fn call(
        &self,
        addr: &str,
        msg: &NetworkMessage,
        timeout: Duration,
    ) -> Result<NetworkMessage, Error>;
}

////////////////////////////////////////////// framing /////////////////////////////////////////////

fn write_framed(stream: &mut TcpStream, from: ServerId, msg: &NetworkMessage) -> Result<(), Error> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&from.get().to_be_bytes());
    body.extend_from_slice(&msg.pack());
    let frame = Frame::from_buffer(&body);
    let frame_buf = stack_pack(&frame).to_vec();
    assert!(frame_buf.len() < 256);
    let mut buf = Vec::with_capacity(1 + frame_buf.len() + body.len());
    buf.push(frame_buf.len() as u8);
    buf.extend_from_slice(&frame_buf);
    buf.extend_from_slice(&body);
    stream.write_all(&buf)?;
    Ok(())
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf)?;
    Ok(())
}

fn read_framed(stream: &mut TcpStream) -> Result<(ServerId, NetworkMessage), Error> {
    let mut len = [0u8; 1];
    read_exact(stream, &mut len)?;
    let mut frame_buf = vec![0u8; len[0] as usize];
    read_exact(stream, &mut frame_buf)?;
    let (frame, _) = Frame::unpack(&frame_buf).map_err(|_| {
        CORRUPT_FRAMES.click();
        Error::corruption("unparseable frame")
    })?;
    let mut body = vec![0u8; frame.size as usize];
    read_exact(stream, &mut body)?;
    if crc32c::crc32c(&body) != frame.crc32c {
        CORRUPT_FRAMES.click();
        return Err(Error::corruption("crc32c mismatch"));
    }
    if body.len() < 8 {
        CORRUPT_FRAMES.click();
        return Err(Error::corruption("frame too short for sender id"));
    }
    let from = ServerId::new(u64::from_be_bytes(body[..8].try_into().unwrap()));
    let msg = NetworkMessage::unpack(&body[8..]).map_err(|_| {
        CORRUPT_FRAMES.click();
        Error::corruption("unparseable message")
    })?;
    Ok((from, msg))
}

/////////////////////////////////////////// TcpTransport ///////////////////////////////////////////

struct TcpInner {
    us: Server,
    configured: Mutex<HashMap<ServerId, String>>,
    aux: Mutex<HashMap<ServerId, String>>,
    peers: Mutex<HashMap<ServerId, TcpStream>>,
    incoming: Sender<(ServerId, NetworkMessage)>,
    next_ephemeral: AtomicU64,
}

impl TcpInner {
    fn lookup(&self, to: ServerId) -> Option<String> {
        if let Some(addr) = self.configured.lock().unwrap().get(&to) {
            return Some(addr.clone());
        }
        self.aux.lock().unwrap().get(&to).cloned()
    }

    fn adopt(self: &Arc<Self>, token: ServerId, stream: TcpStream) {
        let mut read_half = match stream.try_clone() {
            Ok(stream) => stream,
            Err(_) => {
                return;
            }
        };
        self.peers.lock().unwrap().insert(token, stream);
        let inner = Arc::clone(self);
        std::thread::spawn(move || {
            let mut token = token;
            loop {
                match read_framed(&mut read_half) {
                    Ok((from, msg)) => {
                        // An identified peer supersedes the ephemeral token for replies.
                        if from != ServerId::BOTTOM && from != token {
                            let mut peers = inner.peers.lock().unwrap();
                            if let Some(stream) = peers.remove(&token) {
                                peers.insert(from, stream);
                            }
                            token = from;
                        }
                        MESSAGES_RECV.click();
                        if inner.incoming.send((token, msg)).is_err() {
                            break;
                        }
                    }
                    Err(Error::Corruption { .. }) => {
                        clue!(COLLECTOR, WARNING, {
                            transport_corrupt_frame: token.get(),
                        });
                        continue;
                    }
                    Err(_) => {
                        break;
                    }
                }
            }
            inner.peers.lock().unwrap().remove(&token);
        });
    }
}

pub struct TcpTransport {
    inner: Arc<TcpInner>,
    receiver: Mutex<Receiver<(ServerId, NetworkMessage)>>,
}

impl TcpTransport {
    /// Bind `us.bind_to` and start accepting peers.
    pub fn new(us: Server) -> Result<Self, Error> {
        let listener = TcpListener::bind(&us.bind_to)
            .map_err(|err| Error::disrupted(format!("could not bind {}: {}", us.bind_to, err)))?;
        let (incoming, receiver) = channel();
        let inner = Arc::new(TcpInner {
            us,
            configured: Mutex::new(HashMap::new()),
            aux: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            incoming,
            next_ephemeral: AtomicU64::new((1 << 63) + 1),
        });
        let accept_inner = Arc::clone(&inner);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    continue;
                };
                CONNECTIONS_ACCEPTED.click();
                let _ = stream.set_nodelay(true);
                let token = ServerId::new(
                    accept_inner.next_ephemeral.fetch_add(1, Ordering::Relaxed),
                );
                accept_inner.adopt(token, stream);
            }
        });
        Ok(Self {
            inner,
            receiver: Mutex::new(receiver),
        })
    }

    fn connect(&self, to: ServerId) -> Result<(), Error> {
        let Some(addr) = self.inner.lookup(to) else {
            return Err(Error::disrupted(format!("no address for {}", to)));
        };
        let stream = TcpStream::connect(&addr)
            .map_err(|err| Error::disrupted(format!("connect {}: {}", addr, err)))?;
        let _ = stream.set_nodelay(true);
        CONNECTIONS_OPENED.click();
        self.inner.adopt(to, stream);
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn us(&self) -> ServerId {
        self.inner.us.id
    }

    fn send(&self, to: ServerId, msg: &NetworkMessage) -> Result<(), Error> {
        if to == self.inner.us.id {
            MESSAGES_SENT.click();
            self.inner
                .incoming
                .send((to, msg.clone()))
                .map_err(|_| Error::disrupted("loopback closed"))?;
            return Ok(());
        }
        if !self.inner.peers.lock().unwrap().contains_key(&to) {
            self.connect(to)?;
        }
        let mut peers = self.inner.peers.lock().unwrap();
        let Some(stream) = peers.get_mut(&to) else {
            SEND_DISRUPTED.click();
            return Err(Error::disrupted(format!("no channel to {}", to)));
        };
        match write_framed(stream, self.inner.us.id, msg) {
            Ok(()) => {
                MESSAGES_SENT.click();
                Ok(())
            }
            Err(err) => {
                SEND_DISRUPTED.click();
                peers.remove(&to);
                Err(err)
            }
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<(ServerId, NetworkMessage)>, Error> {
        let receiver = self.receiver.lock().unwrap();
        match receiver.recv_timeout(timeout) {
            Ok(x) => Ok(Some(x)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::disrupted("transport receive queue closed"))
            }
        }
    }

    fn set_servers(&self, servers: &[Server]) {
        let mut configured = self.inner.configured.lock().unwrap();
        configured.clear();
        for s in servers {
            configured.insert(s.id, s.bind_to.clone());
        }
        self.inner.aux.lock().unwrap().clear();
    }

    fn add_aux(&self, server: &Server) {
        self.inner
            .aux
            .lock()
            .unwrap()
            .insert(server.id, server.bind_to.clone());
        // Any stale channel reconnects at the corrected address.
        self.inner.peers.lock().unwrap().remove(&server.id);
    }

    fn call(
        &self,
        addr: &str,
        msg: &NetworkMessage,
        timeout: Duration,
    ) -> Result<NetworkMessage, Error> {
        let mut stream = TcpStream::connect(addr)
            .map_err(|err| Error::disrupted(format!("connect {}: {}", addr, err)))?;
        stream.set_read_timeout(Some(timeout))?;
        write_framed(&mut stream, ServerId::BOTTOM, msg)?;
        let (_, reply) = read_framed(&mut stream)?;
        Ok(reply)
    }
}

////////////////////////////////////////////// inproc //////////////////////////////////////////////

pub mod inproc {
    //! An in-process mesh of transports.  Every endpoint registered against the same [Mesh]
    //! reaches every other by id; `call` routes through ephemeral endpoints the way anonymous TCP
    //! clients would.

    use super::*;

    #[derive(Default)]
    struct MeshInner {
        endpoints: Mutex<HashMap<ServerId, Sender<(ServerId, NetworkMessage)>>>,
        addrs: Mutex<HashMap<String, ServerId>>,
        next_ephemeral: AtomicU64,
    }

    #[derive(Clone, Default)]
    pub struct Mesh {
        inner: Arc<MeshInner>,
    }

    impl Mesh {
        pub fn new() -> Self {
            let mesh = Self::default();
            mesh.inner.next_ephemeral.store((1 << 63) + 1, Ordering::Relaxed);
            mesh
        }

        /// Register a server endpoint at its bind address.
        pub fn register(&self, us: &Server) -> MeshTransport {
            let (sender, receiver) = channel();
            self.inner
                .endpoints
                .lock()
                .unwrap()
                .insert(us.id, sender);
            self.inner
                .addrs
                .lock()
                .unwrap()
                .insert(us.bind_to.clone(), us.id);
            MeshTransport {
                mesh: Arc::clone(&self.inner),
                us: us.id,
                receiver: Mutex::new(receiver),
            }
        }

        /// Register an anonymous client endpoint.
        pub fn client(&self) -> MeshTransport {
            let id = ServerId::new(self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed));
            let (sender, receiver) = channel();
            self.inner.endpoints.lock().unwrap().insert(id, sender);
            MeshTransport {
                mesh: Arc::clone(&self.inner),
                us: id,
                receiver: Mutex::new(receiver),
            }
        }
    }

    pub struct MeshTransport {
        mesh: Arc<MeshInner>,
        us: ServerId,
        receiver: Mutex<Receiver<(ServerId, NetworkMessage)>>,
    }

    impl MeshTransport {
        fn send_from(
            &self,
            from: ServerId,
            to: ServerId,
            msg: &NetworkMessage,
        ) -> Result<(), Error> {
            let sender = {
                let endpoints = self.mesh.endpoints.lock().unwrap();
                endpoints.get(&to).cloned()
            };
            let Some(sender) = sender else {
                SEND_DISRUPTED.click();
                return Err(Error::disrupted(format!("no endpoint for {}", to)));
            };
            MESSAGES_SENT.click();
            sender
                .send((from, msg.clone()))
                .map_err(|_| Error::disrupted(format!("endpoint {} closed", to)))
        }
    }

    impl Transport for MeshTransport {
        fn us(&self) -> ServerId {
            self.us
        }

        fn send(&self, to: ServerId, msg: &NetworkMessage) -> Result<(), Error> {
            self.send_from(self.us, to, msg)
        }

        fn recv(&self, timeout: Duration) -> Result<Option<(ServerId, NetworkMessage)>, Error> {
            let receiver = self.receiver.lock().unwrap();
            match receiver.recv_timeout(timeout) {
                Ok(x) => {
                    MESSAGES_RECV.click();
                    Ok(Some(x))
                }
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(Error::disrupted("mesh receive queue closed"))
                }
            }
        }

        fn set_servers(&self, servers: &[Server]) {
            let mut addrs = self.mesh.addrs.lock().unwrap();
            for s in servers {
                addrs.insert(s.bind_to.clone(), s.id);
            }
        }

        fn add_aux(&self, server: &Server) {
            let mut addrs = self.mesh.addrs.lock().unwrap();
            addrs.insert(server.bind_to.clone(), server.id);
        }

        fn call(
            &self,
            addr: &str,
            msg: &NetworkMessage,
            timeout: Duration,
        ) -> Result<NetworkMessage, Error> {
            let to = {
                let addrs = self.mesh.addrs.lock().unwrap();
                addrs.get(addr).copied()
            };
            let Some(to) = to else {
                return Err(Error::disrupted(format!("unknown address {}", addr)));
            };
            let ephemeral =
                ServerId::new(self.mesh.next_ephemeral.fetch_add(1, Ordering::Relaxed));
            let (sender, receiver) = channel();
            self.mesh
                .endpoints
                .lock()
                .unwrap()
                .insert(ephemeral, sender);
            let result = (|| {
                self.send_from(ephemeral, to, msg)?;
                match receiver.recv_timeout(timeout) {
                    Ok((_, reply)) => Ok(reply),
                    Err(_) => Err(Error::disrupted(format!("no reply from {}", addr))),
                }
            })();
            self.mesh.endpoints.lock().unwrap().remove(&ephemeral);
            result
        }
    }

    #[cfg(test)]
    mod tests {
        use replicant_pb::Poke;

        use super::*;

        #[test]
        fn endpoints_exchange_messages() {
            let mesh = Mesh::new();
            let s1 = mesh.register(&Server::new(ServerId::new(1), "h1:1982"));
            let s2 = mesh.register(&Server::new(ServerId::new(2), "h2:1982"));
            s1.send(ServerId::new(2), &NetworkMessage::Pong).unwrap();
            let (from, msg) = s2.recv(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(ServerId::new(1), from);
            assert_eq!(NetworkMessage::Pong, msg);
        }

        #[test]
        fn loopback_delivery() {
            let mesh = Mesh::new();
            let s1 = mesh.register(&Server::new(ServerId::new(1), "h1:1982"));
            s1.send(ServerId::new(1), &NetworkMessage::ObjectFailed)
                .unwrap();
            let (from, msg) = s1.recv(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(ServerId::new(1), from);
            assert_eq!(NetworkMessage::ObjectFailed, msg);
        }

        #[test]
        fn unknown_peer_is_disrupted() {
            let mesh = Mesh::new();
            let s1 = mesh.register(&Server::new(ServerId::new(1), "h1:1982"));
            if let Err(Error::Disrupted { .. }) = s1.send(ServerId::new(9), &NetworkMessage::Pong)
            {
            } else {
                panic!("send to unknown peer should disrupt");
            }
        }

        #[test]
        fn call_routes_reply_to_ephemeral_endpoint() {
            let mesh = Mesh::new();
            let server = mesh.register(&Server::new(ServerId::new(1), "h1:1982"));
            let client = mesh.client();
            let handle = std::thread::spawn(move || {
                let (from, msg) = server.recv(Duration::from_secs(5)).unwrap().unwrap();
                assert_eq!(
                    NetworkMessage::Poke(Poke { client_nonce: 33 }),
                    msg
                );
                server.send(from, &NetworkMessage::Pong).unwrap();
            });
            let reply = client
                .call(
                    "h1:1982",
                    &NetworkMessage::Poke(Poke { client_nonce: 33 }),
                    Duration::from_secs(5),
                )
                .unwrap();
            assert_eq!(NetworkMessage::Pong, reply);
            handle.join().unwrap();
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_send_recv_and_call() {
        let s1 = Server::new(ServerId::new(1), "127.0.0.1:21821");
        let s2 = Server::new(ServerId::new(2), "127.0.0.1:21822");
        let t1 = TcpTransport::new(s1.clone()).unwrap();
        let t2 = TcpTransport::new(s2.clone()).unwrap();
        t1.set_servers(&[s1.clone(), s2.clone()]);
        t2.set_servers(&[s1.clone(), s2.clone()]);
        t1.send(ServerId::new(2), &NetworkMessage::Pong).unwrap();
        let (from, msg) = t2.recv(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(ServerId::new(1), from);
        assert_eq!(NetworkMessage::Pong, msg);
        // An identified inbound peer can be answered by id.
        t2.send(ServerId::new(1), &NetworkMessage::WhoAreYou).unwrap();
        let (from, msg) = t1.recv(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(ServerId::new(2), from);
        assert_eq!(NetworkMessage::WhoAreYou, msg);
        // Anonymous one-shot calls round trip.
        let handle = std::thread::spawn(move || {
            let (from, msg) = t2.recv(Duration::from_secs(5)).unwrap().unwrap();
            assert_eq!(NetworkMessage::SuggestRejoin, msg);
            t2.send(from, &NetworkMessage::Pong).unwrap();
        });
        let reply = t1
            .call(
                "127.0.0.1:21822",
                &NetworkMessage::SuggestRejoin,
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(NetworkMessage::Pong, reply);
        handle.join().unwrap();
    }
}
