//! RPC channel to one worker
//!
//! A channel owns at most one TCP transport at a time. The transport is
//! dialed lazily, greeted with `Hello`/`HelloAck`, and then read by a
//! background task that routes `Response` frames to the waiting caller by
//! request id. Anything the reader sees that nobody asked for (an explicit
//! `Close`, EOF, a malformed frame) is handed to the channel's event sink.

use crate::classifier::RawOutcome;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tether_proto::{read_frame, write_frame, CallResult, CloseReason, Envelope, PROTOCOL_VERSION};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::ConnectError;

/// Bound on the best-effort goodbye sent by [`RpcChannel::close`]
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Network address of a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConnectError::InvalidEndpoint(format!("{} (expected host:port)", s)))?;
        if host.is_empty() {
            return Err(ConnectError::InvalidEndpoint(format!("{} (empty host)", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{} ({})", s, e)))?;
        Ok(Endpoint::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

/// Receives events the channel was not asked about
pub trait ChannelEventSink: Send + Sync {
    fn on_channel_event(&self, raw: RawOutcome);
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<CallResult, RawOutcome>>>>>;

struct Transport {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Request/response channel multiplexed over one TCP connection
pub struct RpcChannel {
    endpoint: Endpoint,
    local_name: String,
    transport: Mutex<Option<Transport>>,
    dial_lock: tokio::sync::Mutex<()>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    sink: Weak<dyn ChannelEventSink>,
}

impl RpcChannel {
    /// Create an unconnected channel.
    ///
    /// `local_name` is announced to the worker in the greeting. Unsolicited
    /// events go to `sink` for as long as it is alive.
    pub fn new(endpoint: Endpoint, local_name: impl Into<String>, sink: Weak<dyn ChannelEventSink>) -> Self {
        Self {
            endpoint,
            local_name: local_name.into(),
            transport: Mutex::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether a greeted transport is currently up
    pub fn is_connected(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        lock(&self.transport)
            .as_ref()
            .map(|t| t.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Dial and greet the worker unless a live transport already exists.
    ///
    /// The whole dial (TCP connect plus greeting) must finish within
    /// `deadline`.
    pub async fn connect(&self, deadline: Duration) -> Result<(), RawOutcome> {
        let _dialing = self.dial_lock.lock().await;
        if self.is_closed() {
            return Err(RawOutcome::io(io::ErrorKind::NotConnected, "channel closed"));
        }
        if self.is_connected() {
            return Ok(());
        }

        debug!("Dialing worker at {}", self.endpoint);
        let (read, write) = match tokio::time::timeout(deadline, self.dial()).await {
            Ok(result) => result?,
            Err(_) => return Err(RawOutcome::DeadlineElapsed { deadline }),
        };

        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            read,
            self.pending.clone(),
            alive.clone(),
            self.closed.clone(),
            self.sink.clone(),
        ));
        let previous = lock(&self.transport).replace(Transport {
            writer: Arc::new(tokio::sync::Mutex::new(write)),
            alive,
            reader,
        });
        if let Some(stale) = previous {
            stale.reader.abort();
        }
        debug!("Transport to {} is up", self.endpoint);
        Ok(())
    }

    async fn dial(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf), RawOutcome> {
        let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;
        stream.set_nodelay(true)?;
        let (mut read, mut write) = stream.into_split();

        let hello = Envelope::Hello {
            protocol_version: PROTOCOL_VERSION,
            peer: self.local_name.clone(),
        };
        write_frame(&mut write, &hello).await?;

        match read_frame(&mut read).await? {
            Some(Envelope::HelloAck { protocol_version }) if protocol_version == PROTOCOL_VERSION => {
                Ok((read, write))
            }
            Some(Envelope::HelloAck { protocol_version }) => {
                Err(RawOutcome::PeerClosed(CloseReason::Protocol {
                    detail: format!(
                        "worker speaks protocol {}, expected {}",
                        protocol_version, PROTOCOL_VERSION
                    ),
                }))
            }
            Some(Envelope::Close { reason }) => Err(RawOutcome::PeerClosed(reason)),
            Some(other) => Err(RawOutcome::ProtocolViolation(format!(
                "expected hello_ack, got {}",
                frame_name(&other)
            ))),
            None => Err(RawOutcome::io(
                io::ErrorKind::UnexpectedEof,
                "worker closed the connection during greeting",
            )),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Dropping the returned future abandons the call: its pending slot is
    /// released and a late response is discarded.
    pub async fn call(&self, call: &str, body: Value) -> Result<CallResult, RawOutcome> {
        let writer = {
            let transport = lock(&self.transport);
            match transport.as_ref() {
                Some(t) if t.alive.load(Ordering::SeqCst) && !self.is_closed() => t.writer.clone(),
                _ => {
                    return Err(RawOutcome::io(
                        io::ErrorKind::NotConnected,
                        "no live transport",
                    ))
                }
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        let request = Envelope::Request {
            id,
            call: call.to_string(),
            body,
        };
        trace!("Sending {} as request {}", call, id);
        {
            let mut writer = writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &request).await {
                self.mark_dead();
                return Err(e.into());
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RawOutcome::io(
                io::ErrorKind::ConnectionAborted,
                "call abandoned by the channel",
            )),
        }
    }

    fn mark_dead(&self) {
        if let Some(t) = lock(&self.transport).as_ref() {
            t.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Release the transport without notifying the peer or the sink.
    ///
    /// Outstanding calls fail with a transport error. Safe to call from the
    /// sink itself.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(t) = lock(&self.transport).take() {
            t.alive.store(false, Ordering::SeqCst);
            t.reader.abort();
        }
        fail_pending(
            &self.pending,
            RawOutcome::io(io::ErrorKind::NotConnected, "channel shut down"),
        );
    }

    /// Close the channel, sending a best-effort goodbye. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = lock(&self.transport).take();
        if let Some(t) = transport {
            if t.alive.swap(false, Ordering::SeqCst) {
                let goodbye = Envelope::Close {
                    reason: CloseReason::Goodbye,
                };
                let farewell = async {
                    let mut writer = t.writer.lock().await;
                    let _ = write_frame(&mut *writer, &goodbye).await;
                    let _ = writer.shutdown().await;
                };
                if tokio::time::timeout(CLOSE_GRACE, farewell).await.is_err() {
                    debug!("Goodbye to {} not delivered within grace period", self.endpoint);
                }
            }
            t.reader.abort();
        }
        fail_pending(
            &self.pending,
            RawOutcome::io(io::ErrorKind::NotConnected, "channel closed"),
        );
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        if let Some(t) = lock(&self.transport).take() {
            t.reader.abort();
        }
    }
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a pending entry when the call future completes or is dropped
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    pending: Pending,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    sink: Weak<dyn ChannelEventSink>,
) {
    let ended = loop {
        match read_frame(&mut read).await {
            Ok(Some(Envelope::Response { id, result })) => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(result));
                    }
                    None => trace!("Discarding response to abandoned request {}", id),
                }
            }
            Ok(Some(Envelope::Close { reason })) => break RawOutcome::PeerClosed(reason),
            Ok(Some(other)) => {
                break RawOutcome::ProtocolViolation(format!(
                    "unexpected {} frame from worker",
                    frame_name(&other)
                ))
            }
            Ok(None) => {
                break RawOutcome::io(
                    io::ErrorKind::UnexpectedEof,
                    "worker closed the connection",
                )
            }
            Err(e) => break e.into(),
        }
    };

    alive.store(false, Ordering::SeqCst);
    fail_pending(&pending, ended.clone());

    if closed.load(Ordering::SeqCst) {
        return;
    }
    match sink.upgrade() {
        Some(sink) => sink.on_channel_event(ended),
        None => trace!("Channel owner gone; dropping {:?}", ended),
    }
}

fn fail_pending(pending: &Pending, raw: RawOutcome) {
    let waiters: Vec<_> = lock(pending).drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(raw.clone()));
    }
}

fn frame_name(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::Hello { .. } => "hello",
        Envelope::HelloAck { .. } => "hello_ack",
        Envelope::Request { .. } => "request",
        Envelope::Response { .. } => "response",
        Envelope::Close { .. } => "close",
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::RemoteErrorKind;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<RawOutcome>>,
    }

    impl ChannelEventSink for Recorder {
        fn on_channel_event(&self, raw: RawOutcome) {
            self.events.lock().unwrap().push(raw);
        }
    }

    fn channel_to(addr: std::net::SocketAddr, sink: &Arc<Recorder>) -> RpcChannel {
        let weak: Weak<dyn ChannelEventSink> = Arc::downgrade(&(sink.clone() as Arc<dyn ChannelEventSink>));
        RpcChannel::new(Endpoint::from(addr), "test-orchestrator", weak)
    }

    /// Accept one connection, answer the greeting, then echo requests
    async fn echo_worker(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = stream.into_split();
        match read_frame(&mut read).await.unwrap() {
            Some(Envelope::Hello { .. }) => {}
            other => panic!("expected hello, got {:?}", other),
        }
        write_frame(
            &mut write,
            &Envelope::HelloAck {
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();

        while let Ok(Some(frame)) = read_frame(&mut read).await {
            match frame {
                Envelope::Request { id, call, body } if call == "Echo" => {
                    let result = CallResult::Ok { value: body };
                    write_frame(&mut write, &Envelope::Response { id, result })
                        .await
                        .unwrap();
                }
                Envelope::Request { id, .. } => {
                    let result = CallResult::err(RemoteErrorKind::UnknownCall, "no such call");
                    write_frame(&mut write, &Envelope::Response { id, result })
                        .await
                        .unwrap();
                }
                Envelope::Close { .. } => break,
                _ => {}
            }
        }
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "worker-3.local:7400".parse().unwrap();
        assert_eq!(endpoint.host, "worker-3.local");
        assert_eq!(endpoint.port, 7400);
        assert_eq!(endpoint.to_string(), "worker-3.local:7400");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":7400".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(echo_worker(listener));

        let sink = Arc::new(Recorder::default());
        let channel = channel_to(addr, &sink);
        assert!(!channel.is_connected());

        channel.connect(Duration::from_secs(5)).await.unwrap();
        assert!(channel.is_connected());

        let result = channel
            .call("Echo", serde_json::json!({"n": 7}))
            .await
            .unwrap();
        assert_eq!(
            result,
            CallResult::Ok {
                value: serde_json::json!({"n": 7})
            }
        );

        let result = channel.call("Nope", Value::Null).await.unwrap();
        assert!(matches!(result, CallResult::Err { .. }));

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_connected());
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused_is_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = Arc::new(Recorder::default());
        let channel = channel_to(addr, &sink);
        let err = channel.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, RawOutcome::Io { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_connect_deadline_when_never_greeted() {
        // Bound but never accepted: the TCP handshake completes via the
        // backlog, the greeting never does.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sink = Arc::new(Recorder::default());
        let channel = channel_to(addr, &sink);
        let err = channel
            .connect(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RawOutcome::DeadlineElapsed {
                deadline: Duration::from_millis(200)
            }
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_peer_close_reaches_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = stream.into_split();
            let _ = read_frame(&mut read).await.unwrap();
            write_frame(
                &mut write,
                &Envelope::HelloAck {
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await
            .unwrap();
            write_frame(
                &mut write,
                &Envelope::Close {
                    reason: CloseReason::Shutdown {
                        detail: "worker stopping".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        });

        let sink = Arc::new(Recorder::default());
        let channel = channel_to(addr, &sink);
        channel.connect(Duration::from_secs(5)).await.unwrap();

        for _ in 0..100 {
            if !sink.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![RawOutcome::PeerClosed(CloseReason::Shutdown {
                detail: "worker stopping".to_string()
            })]
        );
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_call_without_transport() {
        let sink = Arc::new(Recorder::default());
        let channel = channel_to("127.0.0.1:1".parse().unwrap(), &sink);
        let err = channel.call("Echo", Value::Null).await.unwrap_err();
        assert!(matches!(
            err,
            RawOutcome::Io {
                kind: io::ErrorKind::NotConnected,
                ..
            }
        ));
    }
}
