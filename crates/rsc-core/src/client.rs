//! Multiplexed, authenticated client link.
//!
//! One TLS connection carries every request. A writer task owns the write
//! half, a reader task owns the read half and completes callers through a
//! correlation-id keyed map of one-shot channels, so responses may arrive in
//! any order. When the link drops every outstanding call fails with
//! [`RscError::ConnectionLost`]; nothing is replayed on the next link.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::auth::{self, EXPORTER_LABEL, EXPORTER_LEN};
use crate::codec::{Frame, Request, Response, encode_frame, read_frame};
use crate::config::ClientConfig;
use crate::error::{RscError, RscResult};
use crate::tls;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const OUTBOUND_DEPTH: usize = 64;

type Completion = oneshot::Sender<RscResult<Response>>;

#[derive(Default)]
struct LinkShared {
    pending: Mutex<HashMap<u64, Completion>>,
    closed: AtomicBool,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the link dead and fails every waiter. Closing before draining
    /// guarantees a caller that registers late observes the flag.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing in-flight requests");
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(RscError::ConnectionLost));
        }
    }
}

struct Link {
    outbound: mpsc::Sender<Vec<u8>>,
    shared: Arc<LinkShared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.outbound.is_closed()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.fail_all();
    }
}

pub struct RemoteClient {
    config: ClientConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    link: tokio::sync::Mutex<Option<Arc<Link>>>,
    next_correlation: AtomicU64,
    epoch: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("config", &self.config)
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl RemoteClient {
    /// Builds the client and establishes the first authenticated link.
    pub async fn connect(config: ClientConfig) -> RscResult<Self> {
        let client = Self::new(config)?;
        client.link().await?;
        Ok(client)
    }

    pub fn new(config: ClientConfig) -> RscResult<Self> {
        let tls_config = tls::client_config(&config.pin)?;
        let server_name = tls::server_name(&config.addr)?;
        Ok(Self {
            config,
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            link: tokio::sync::Mutex::new(None),
            next_correlation: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Increments every time a replacement link is established. Server-side
    /// state from an earlier epoch is gone.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Sends one request and waits for its response.
    pub async fn call(&self, request: Request) -> RscResult<Response> {
        let link = self.link().await?;
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let opcode = request.opcode();
        let frame = encode_frame(
            &Frame::Request {
                correlation,
                request,
            },
            self.config.max_frame_len,
        )?;

        let (tx, rx) = oneshot::channel();
        link.shared.pending.lock().insert(correlation, tx);
        if link.shared.is_closed() || link.outbound.send(frame).await.is_err() {
            link.shared.pending.lock().remove(&correlation);
            return Err(RscError::ConnectionLost);
        }

        let response = match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(RscError::ConnectionLost),
            Err(_) => {
                link.shared.pending.lock().remove(&correlation);
                warn!(correlation, ?opcode, "request timed out");
                return Err(RscError::Timeout(self.config.timeout));
            }
        };
        if response.opcode != opcode {
            return Err(RscError::framing(format!(
                "response opcode {:?} does not match request {opcode:?}",
                response.opcode
            )));
        }
        Ok(response)
    }

    /// Tears down the link. Outstanding calls fail; later calls are refused.
    pub async fn close(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shared.fail_all();
            drop(link);
            info!("remote link closed");
        }
    }

    async fn link(&self) -> RscResult<Arc<Link>> {
        let mut guard = self.link.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RscError::ConnectionLost);
        }
        if let Some(link) = guard.as_ref()
            && !link.is_closed()
        {
            return Ok(link.clone());
        }
        let replacing = guard.take().is_some();
        let link = Arc::new(self.connect_with_retry().await?);
        if replacing {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            info!(epoch, addr = %self.config.addr, "re-established remote link");
        }
        *guard = Some(link.clone());
        Ok(link)
    }

    async fn connect_with_retry(&self) -> RscResult<Link> {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.connect_once().await {
                Ok(link) => return Ok(link),
                Err(err) if err.is_retryable() && attempt <= self.config.retries => {
                    warn!(attempt, error = %err, "connection attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn connect_once(&self) -> RscResult<Link> {
        let limit = self.config.connect_timeout;
        let tcp = tokio::time::timeout(limit, TcpStream::connect(&self.config.addr))
            .await
            .map_err(|_| RscError::Timeout(limit))??;
        tcp.set_nodelay(true)?;

        let mut stream =
            tokio::time::timeout(limit, self.connector.connect(self.server_name.clone(), tcp))
                .await
                .map_err(|_| RscError::Timeout(limit))?
                .map_err(classify_tls_error)?;

        let exporter = stream
            .get_ref()
            .1
            .export_keying_material([0u8; EXPORTER_LEN], EXPORTER_LABEL, None)
            .map_err(RscError::tls)?;
        tokio::time::timeout(
            limit,
            auth::authenticate(
                &mut stream,
                &exporter,
                &self.config.fingerprint,
                &self.config.secret,
                self.config.max_frame_len,
            ),
        )
        .await
        .map_err(|_| RscError::Timeout(limit))??;
        info!(addr = %self.config.addr, "authenticated remote link");

        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(LinkShared::default());
        let (outbound, rx) = mpsc::channel(OUTBOUND_DEPTH);
        let reader = tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            self.config.max_frame_len,
        ));
        let writer = tokio::spawn(write_loop(write_half, rx, shared.clone()));
        Ok(Link {
            outbound,
            shared,
            reader,
            writer,
        })
    }
}

/// A certificate that fails the pin surfaces as an io error wrapping a
/// rustls error; keep it distinct so it is never retried.
fn classify_tls_error(err: std::io::Error) -> RscError {
    let is_tls = err
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some());
    if is_tls {
        RscError::tls(err)
    } else {
        RscError::Io(err)
    }
}

async fn read_loop(
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    shared: Arc<LinkShared>,
    max_frame_len: usize,
) {
    loop {
        match read_frame(&mut reader, max_frame_len).await {
            Ok(Some(Frame::Response(response))) => {
                let waiter = shared.pending.lock().remove(&response.correlation);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(response));
                    }
                    None => debug!(
                        correlation = response.correlation,
                        "discarding response for abandoned request"
                    ),
                }
            }
            Ok(Some(_)) => {
                warn!("server sent a non-response frame; dropping link");
                break;
            }
            Ok(None) => {
                debug!("server closed the link");
                break;
            }
            Err(err) => {
                warn!(error = %err, "link read failed");
                break;
            }
        }
    }
    shared.fail_all();
}

async fn write_loop(
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<LinkShared>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(error = %err, "link write failed");
            shared.fail_all();
            return;
        }
        if let Err(err) = writer.flush().await {
            warn!(error = %err, "link flush failed");
            shared.fail_all();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
