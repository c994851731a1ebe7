use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Incoming,
    Outgoing,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Incoming => Side::Outgoing,
            Side::Outgoing => Side::Incoming,
        }
    }
}

struct Buffers {
    write_half: Option<OwnedWriteHalf>,
    data_in: Vec<u8>,
    data_out: Vec<u8>,
    closed: bool,
}

impl Buffers {
    fn empty() -> Self {
        Self {
            write_half: None,
            data_in: Vec::new(),
            data_out: Vec::new(),
            closed: false,
        }
    }
}

struct Endpoint {
    buffers: Mutex<Buffers>,
}

impl Endpoint {
    fn empty() -> Self {
        Self {
            buffers: Mutex::new(Buffers::empty()),
        }
    }
}

/// A half-duplex-swap bidirectional byte relay between two sockets. Received
/// bytes are buffered per side until the peer socket is attached, then
/// handed off to the peer's write call without extra copies: the receiving
/// side's `data_in` and `data_out` buffers are swapped rather than copied.
pub struct Forwarder {
    incoming: Endpoint,
    outgoing: Endpoint,
    on_close: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    fired: AtomicBool,
}

impl Forwarder {
    /// Creates a forwarder bound to an already-accepted inbound connection.
    /// The outbound side is attached later via `set_outgoing`, once the
    /// upstream application is healthy and reachable.
    pub fn new(client: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = client.into_split();
        let forwarder = Arc::new(Forwarder {
            incoming: Endpoint::empty(),
            outgoing: Endpoint::empty(),
            on_close: std::sync::Mutex::new(None),
            fired: AtomicBool::new(false),
        });
        {
            let mut buf = forwarder.incoming.buffers.try_lock().expect("fresh lock");
            buf.write_half = Some(write_half);
        }
        spawn_reader(forwarder.clone(), Side::Incoming, read_half);
        forwarder
    }

    /// Attaches the upstream connection once it is available. Any bytes the
    /// client already sent (buffered while no upstream existed) are flushed
    /// immediately.
    pub fn set_outgoing(self: &Arc<Self>, upstream: TcpStream) {
        let (read_half, write_half) = upstream.into_split();
        {
            let mut buf = self.outgoing.buffers.try_lock().expect("fresh lock");
            if buf.closed {
                return;
            }
            buf.write_half = Some(write_half);
        }
        spawn_reader(self.clone(), Side::Outgoing, read_half);
        let me = self.clone();
        tokio::spawn(async move { me.flush(Side::Incoming).await });
    }

    /// Registers the callback fired exactly once, after both endpoints have
    /// closed.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(f));
    }

    /// Force-closes the inbound side (and, through the usual teardown
    /// cascade, the outbound side once attached). Used when the upstream
    /// never became reachable and the client connection must be abandoned.
    pub fn shutdown(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move { me.close(Side::Incoming).await });
    }

    fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Incoming => &self.incoming,
            Side::Outgoing => &self.outgoing,
        }
    }

    async fn on_data(self: &Arc<Self>, side: Side, bytes: Vec<u8>) {
        {
            let mut buf = self.endpoint(side).buffers.lock().await;
            if buf.closed {
                return;
            }
            buf.data_in.extend_from_slice(&bytes);
        }
        self.flush(side).await;
    }

    /// Drains `side`'s `data_in` to the peer's socket, swapping into
    /// `data_out` to avoid copying, and keeps draining while more arrives.
    async fn flush(self: &Arc<Self>, side: Side) {
        let peer_side = side.other();
        loop {
            let maybe_buf = {
                let mut from = self.endpoint(side).buffers.lock().await;
                if from.closed || !from.data_out.is_empty() || from.data_in.is_empty() {
                    None
                } else {
                    std::mem::swap(&mut from.data_in, &mut from.data_out);
                    Some(())
                }
            };
            if maybe_buf.is_none() {
                return;
            }

            let mut to = self.endpoint(peer_side).buffers.lock().await;
            if to.write_half.is_none() {
                // Peer not attached yet: undo the swap so bytes stay pending
                // in `data_in` until attach, per the no-drop guarantee.
                drop(to);
                let mut from = self.endpoint(side).buffers.lock().await;
                std::mem::swap(&mut from.data_in, &mut from.data_out);
                return;
            }

            let bytes = {
                let from = self.endpoint(side).buffers.lock().await;
                from.data_out.clone()
            };
            let write_result = to.write_half.as_mut().unwrap().write_all(&bytes).await;
            drop(to);

            if write_result.is_err() {
                self.close(peer_side).await;
                self.close(side).await;
                return;
            }

            let mut from = self.endpoint(side).buffers.lock().await;
            from.data_out.clear();
        }
    }

    /// Marks `side` closed and idempotently tears down the pair: if the
    /// peer is already closed, fires `on_close` exactly once; otherwise
    /// closes the peer too.
    async fn close(self: &Arc<Self>, side: Side) {
        let already_closed = {
            let mut buf = self.endpoint(side).buffers.lock().await;
            let was_closed = buf.closed;
            buf.closed = true;
            buf.write_half = None;
            was_closed
        };
        if already_closed {
            return;
        }

        let peer_side = side.other();
        let peer_closed = { self.endpoint(peer_side).buffers.lock().await.closed };
        if peer_closed {
            self.fire_on_close();
        } else {
            Box::pin(self.clone().close(peer_side)).await;
        }
    }

    fn fire_on_close(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Some(f) = self.on_close.lock().unwrap().take() {
            f();
        }
    }
}

fn spawn_reader(forwarder: Arc<Forwarder>, side: Side, mut read_half: tokio::net::tcp::OwnedReadHalf) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    trace!("{side:?} side reached EOF");
                    forwarder.close(side).await;
                    return;
                }
                Ok(n) => {
                    forwarder.on_data(side, buf[..n].to_vec()).await;
                }
                Err(e) => {
                    debug!("{side:?} side read error: {e}");
                    forwarder.close(side).await;
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn echoes_bytes_between_client_and_upstream() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let echo_task = tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (client, _) = front_listener.accept().await.unwrap();
            let forwarder = Forwarder::new(client);
            let closed = Arc::new(StdAtomicBool::new(false));
            let closed2 = closed.clone();
            forwarder.on_close(move || {
                closed2.store(true, Ordering::SeqCst);
            });
            let upstream = TcpStream::connect(upstream_addr).await.unwrap();
            forwarder.set_outgoing(upstream);
            closed
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let mut response = [0u8; 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"hello");

        echo_task.await.unwrap();
        drop(client);
        let _ = accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn buffers_bytes_received_before_upstream_attached() {
        let front_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (client, _) = front_listener.accept().await.unwrap();
            Forwarder::new(client)
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"buffered").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let forwarder = accept_task.await.unwrap();
        let upstream = TcpStream::connect(upstream_addr).await.unwrap();
        forwarder.set_outgoing(upstream);

        let (mut sock, _) = upstream_listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"buffered");
    }
}
