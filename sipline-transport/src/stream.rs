//! Connection pool for stream transports (tcp/tls).
//!
//! One pool per leg: a listener feeding inbound connections and a map of
//! established connections keyed by peer address, shared by both
//! directions so responses reuse the request's connection. Each
//! connection runs a framed reader task and a writer task; the writer
//! acknowledges every frame so reliable deliveries complete on write
//! completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use sipline_core::{Address, TransportProto};

use crate::codec::{SipCodec, DEFAULT_MAX_MESSAGE};
use crate::error::{Error, Result};
use crate::leg::Leg;
use crate::tls::TlsConfig;
use crate::PacketSink;

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}
type BoxedIo = Box<dyn Io>;

type WriteReq = (Bytes, oneshot::Sender<std::io::Result<()>>);

#[derive(Clone)]
struct Conn {
    tx: mpsc::Sender<WriteReq>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct StreamPool {
    proto: TransportProto,
    local: SocketAddr,
    tls: Option<TlsConfig>,
    listener: Mutex<Option<TcpListener>>,
    conns: Mutex<HashMap<SocketAddr, Conn>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    max_message: usize,
}

impl StreamPool {
    pub(crate) async fn bind(
        proto: TransportProto,
        addr: SocketAddr,
        tls: Option<TlsConfig>,
    ) -> Result<Arc<Self>> {
        if proto == TransportProto::Tls && tls.is_none() {
            return Err(Error::NoTlsConfig);
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        Ok(Arc::new(Self {
            proto,
            local,
            tls,
            listener: Mutex::new(Some(listener)),
            conns: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            max_message: DEFAULT_MAX_MESSAGE,
        }))
    }

    pub(crate) fn local(&self) -> SocketAddr {
        self.local
    }

    /// Run the accept loop, feeding inbound connections into the pool.
    pub(crate) fn start(self: &Arc<Self>, leg: Leg, sink: Arc<dyn PacketSink>) -> JoinHandle<()> {
        let pool = self.clone();
        let listener = lock(&self.listener).take();
        tokio::spawn(async move {
            let Some(listener) = listener else {
                warn!("stream leg started twice");
                return;
            };
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let io: BoxedIo = if pool.proto == TransportProto::Tls {
                            let Some(server) = pool.tls.as_ref().and_then(|t| t.server.clone())
                            else {
                                warn!(%peer, "dropping inbound TLS connection, no server config");
                                continue;
                            };
                            match TlsAcceptor::from(server).accept(stream).await {
                                Ok(tls) => Box::new(tls),
                                Err(e) => {
                                    warn!(%peer, error = %e, "TLS accept failed");
                                    continue;
                                }
                            }
                        } else {
                            Box::new(stream)
                        };
                        debug!(%peer, "inbound stream connection");
                        pool.install(peer, io, leg.clone(), sink.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        })
    }

    /// Send one serialized message, connecting on demand. Resolves once
    /// the bytes are flushed to the socket.
    pub(crate) async fn send(
        self: &Arc<Self>,
        dst: &Address,
        data: Bytes,
        leg: &Leg,
        sink: &Arc<dyn PacketSink>,
    ) -> Result<()> {
        let conn = self.get_or_connect(dst, leg, sink).await?;
        let (done_tx, done_rx) = oneshot::channel();
        if conn.tx.send((data.clone(), done_tx)).await.is_err() {
            // The pooled connection raced shut; retry once on a fresh one.
            lock(&self.conns).remove(&dst.socket_addr());
            let conn = self.get_or_connect(dst, leg, sink).await?;
            let (done_tx, done_rx) = oneshot::channel();
            conn.tx
                .send((data, done_tx))
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            done_rx.await.map_err(|_| Error::ConnectionClosed)??;
            return Ok(());
        }
        done_rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(())
    }

    async fn get_or_connect(
        self: &Arc<Self>,
        dst: &Address,
        leg: &Leg,
        sink: &Arc<dyn PacketSink>,
    ) -> Result<Conn> {
        if let Some(conn) = lock(&self.conns).get(&dst.socket_addr()).cloned() {
            return Ok(conn);
        }
        let stream = TcpStream::connect(dst.socket_addr()).await?;
        stream.set_nodelay(true).ok();
        let io: BoxedIo = if self.proto == TransportProto::Tls {
            let tls = self.tls.as_ref().ok_or(Error::NoTlsConfig)?;
            // SNI comes from the retained hostname, not the resolved IP.
            let name = ServerName::try_from(dst.host.clone())
                .map_err(|_| Error::tls(format!("invalid SNI host {:?}", dst.host)))?;
            let connector = TlsConnector::from(tls.client.clone());
            Box::new(connector.connect(name, stream).await?)
        } else {
            Box::new(stream)
        };
        debug!(dst = %dst, "outbound stream connection");
        Ok(self.install(dst.socket_addr(), io, leg.clone(), sink.clone()))
    }

    fn install(
        self: &Arc<Self>,
        peer: SocketAddr,
        io: BoxedIo,
        leg: Leg,
        sink: Arc<dyn PacketSink>,
    ) -> Conn {
        let (rd, wr) = tokio::io::split(io);
        let (tx, mut rx) = mpsc::channel::<WriteReq>(64);
        let conn = Conn { tx };
        lock(&self.conns).insert(peer, conn.clone());

        let pool = self.clone();
        let writer = tokio::spawn(async move {
            let mut wr = wr;
            while let Some((data, done)) = rx.recv().await {
                let res = async {
                    wr.write_all(&data).await?;
                    wr.flush().await
                }
                .await;
                let failed = res.is_err();
                let _ = done.send(res);
                if failed {
                    break;
                }
            }
            let _ = wr.shutdown().await;
            lock(&pool.conns).remove(&peer);
        });

        let pool = self.clone();
        let reader = tokio::spawn(async move {
            let mut framed = FramedRead::new(rd, SipCodec::new(pool.max_message));
            let from = Address::from_socket_addr(pool.proto, peer);
            while let Some(item) = framed.next().await {
                match item {
                    Ok(packet) => {
                        leg.note_received();
                        sink.incoming(packet, leg.clone(), from.clone()).await;
                    }
                    Err(e) => {
                        leg.note_parse_error();
                        warn!(%peer, error = %e, "stream receive failed, closing");
                        break;
                    }
                }
            }
            debug!(%peer, "stream connection closed");
            lock(&pool.conns).remove(&peer);
        });

        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(writer);
        tasks.push(reader);
        conn
    }

    /// Drop every connection and stop their tasks. The accept loop is
    /// owned (and aborted) by the leg registry.
    pub(crate) fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.conns).clear();
    }
}
