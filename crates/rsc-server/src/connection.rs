//! One client connection: TLS, authentication, then request service.
//!
//! Requests naming the same session run one after another on that
//! session's lane; requests without a session share a connection lane.
//! Lanes of different sessions proceed independently, so responses may
//! leave in a different order than requests arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cryptoki_sys::CKR_DEVICE_ERROR;
use parking_lot::Mutex;
use rsc_core::auth::{EXPORTER_LABEL, EXPORTER_LEN};
use rsc_core::codec::{Frame, encode_frame, read_frame};
use rsc_core::{Opcode, Reply, Request, Response, RscError, RscResult};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, info, warn};

use crate::auth::{ClientRegistry, accept_client};
use crate::dispatch::Dispatcher;
use crate::state::ConnectionState;

const LANE_DEPTH: usize = 32;
const OUTBOUND_DEPTH: usize = 64;

/// Everything a connection needs from the server.
pub struct Service {
    pub acceptor: TlsAcceptor,
    pub registry: Arc<ClientRegistry>,
    pub dispatcher: Dispatcher,
    pub handshake_timeout: Duration,
    pub max_frame_len: usize,
}

type Job = (u64, Request);

struct Lane {
    tx: mpsc::Sender<Job>,
}

pub async fn serve(service: Arc<Service>, tcp: TcpStream, peer: SocketAddr) {
    match run(&service, tcp, peer).await {
        Ok(()) => debug!(%peer, "connection finished"),
        Err(RscError::Auth(reason)) => debug!(%peer, %reason, "connection refused"),
        Err(err) => warn!(%peer, error = %err, "connection failed"),
    }
}

async fn run(service: &Arc<Service>, tcp: TcpStream, peer: SocketAddr) -> RscResult<()> {
    tcp.set_nodelay(true)?;
    let limit = service.handshake_timeout;
    let mut stream = tokio::time::timeout(limit, service.acceptor.accept(tcp))
        .await
        .map_err(|_| RscError::Timeout(limit))?
        .map_err(RscError::tls)?;

    let exporter = stream
        .get_ref()
        .1
        .export_keying_material([0u8; EXPORTER_LEN], EXPORTER_LABEL, None)
        .map_err(RscError::tls)?;
    let fingerprint = tokio::time::timeout(
        limit,
        accept_client(
            &mut stream,
            &service.registry,
            &exporter,
            service.max_frame_len,
        ),
    )
    .await
    .map_err(|_| RscError::Timeout(limit))??;

    let conn = Arc::new(service.dispatcher.new_connection());
    let connection = conn.lock().id();
    info!(%peer, %fingerprint, connection, "client connected");

    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, rx) = mpsc::channel(OUTBOUND_DEPTH);
    let writer = tokio::spawn(write_loop(writer, rx, service.max_frame_len));

    let closed = Arc::new(AtomicBool::new(false));
    let mut lanes: HashMap<Option<u64>, Lane> = HashMap::new();
    let mut tasks = JoinSet::new();
    let worker = Worker {
        dispatcher: service.dispatcher.clone(),
        conn: conn.clone(),
        outbound: outbound.clone(),
        closed: closed.clone(),
    };

    let result = loop {
        let (correlation, request) = match read_frame(&mut reader, service.max_frame_len).await {
            Ok(Some(Frame::Request {
                correlation,
                request,
            })) => (correlation, request),
            Ok(Some(_)) => break Err(RscError::framing("client sent a non-request frame")),
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        route(&worker, &mut lanes, &mut tasks, correlation, request).await;
    };

    // Let started provider calls finish, then release what the connection
    // still holds. Queued requests are dropped unanswered.
    closed.store(true, Ordering::SeqCst);
    drop(lanes);
    while tasks.join_next().await.is_some() {}
    service.dispatcher.teardown(&conn).await;
    drop(worker);
    drop(outbound);
    let _ = writer.await;
    info!(%peer, connection, "client disconnected");
    result
}

#[derive(Clone)]
struct Worker {
    dispatcher: Dispatcher,
    conn: Arc<Mutex<ConnectionState>>,
    outbound: mpsc::Sender<Response>,
    closed: Arc<AtomicBool>,
}

impl Worker {
    async fn answer(&self, correlation: u64, request: Request) {
        let opcode = request.opcode();
        let (rv, reply) = self.dispatcher.dispatch(&self.conn, request).await;
        let response = Response {
            correlation,
            opcode,
            rv: rv as u64,
            reply,
        };
        if self.outbound.send(response).await.is_err() {
            debug!(correlation, "discarding result for closed connection");
        }
    }

    async fn lane(self, mut rx: mpsc::Receiver<Job>) {
        while let Some((correlation, request)) = rx.recv().await {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let closes = request.opcode() == Opcode::CloseSession;
            let session = request.session();
            self.answer(correlation, request).await;
            // A closed session gets no more requests routed here; whatever
            // is already queued still gets its answer.
            if closes && session.is_some_and(|id| self.conn.lock().session(id).is_err()) {
                rx.close();
            }
        }
    }
}

async fn route(
    worker: &Worker,
    lanes: &mut HashMap<Option<u64>, Lane>,
    tasks: &mut JoinSet<()>,
    correlation: u64,
    request: Request,
) {
    while tasks.try_join_next().is_some() {}
    prune(worker, lanes);

    let key = request.session();
    let mut job = (correlation, request);

    if let Some(lane) = lanes.get(&key) {
        match lane.tx.send(job).await {
            Ok(()) => return,
            Err(mpsc::error::SendError(returned)) => {
                lanes.remove(&key);
                job = returned;
            }
        }
    }

    // Only sessions this connection knows about get a lane of their own;
    // anything else resolves to an invalid handle without ordering concerns.
    let known = match key {
        Some(id) => worker.conn.lock().session(id).is_ok(),
        None => true,
    };
    if !known {
        let worker = worker.clone();
        tasks.spawn(async move { worker.answer(job.0, job.1).await });
        return;
    }

    let (tx, rx) = mpsc::channel(LANE_DEPTH);
    tasks.spawn(worker.clone().lane(rx));
    if tx.send(job).await.is_ok() {
        lanes.insert(key, Lane { tx });
    }
}

/// Drops the lanes of sessions that ended outside their own lane, such as
/// through `CloseAllSessions`. A dropped lane still answers what it has
/// queued, then its task exits.
fn prune(worker: &Worker, lanes: &mut HashMap<Option<u64>, Lane>) {
    let conn = worker.conn.lock();
    lanes.retain(|key, _| key.is_none_or(|id| conn.session(id).is_ok()));
}

async fn write_loop(
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<Response>,
    max_frame_len: usize,
) {
    while let Some(response) = rx.recv().await {
        let (correlation, opcode) = (response.correlation, response.opcode);
        let bytes = match encode_frame(&Frame::Response(response), max_frame_len) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(correlation, error = %err, "response not encodable");
                let fallback = Response {
                    correlation,
                    opcode,
                    rv: CKR_DEVICE_ERROR as u64,
                    reply: Reply::Empty,
                };
                match encode_frame(&Frame::Response(fallback), max_frame_len) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            }
        };
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(error = %err, "connection write failed");
            return;
        }
        if rx.is_empty()
            && let Err(err) = writer.flush().await
        {
            debug!(error = %err, "connection flush failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryToken, MemoryTokenConfig, ProviderGate};
    use crate::state::SharedState;
    use cryptoki_sys::{
        CKA_CLASS, CKA_SIGN, CKA_VALUE, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKM_SHA256_HMAC,
        CKO_SECRET_KEY, CKR_OK, CKU_USER,
    };
    use hmac::{Hmac, Mac};
    use rsc_core::{Attribute, Mechanism};
    use sha2::Sha256;

    const OK: u64 = CKR_OK as u64;

    /// Feeds requests through `route` the way the read loop does, without
    /// a socket in between.
    struct Harness {
        worker: Worker,
        lanes: HashMap<Option<u64>, Lane>,
        tasks: JoinSet<()>,
        responses: mpsc::Receiver<Response>,
        next: u64,
    }

    impl Harness {
        fn new() -> Self {
            let token = Arc::new(MemoryToken::new(MemoryTokenConfig::default()));
            let dispatcher = Dispatcher::new(
                Arc::new(ProviderGate::new(token)),
                Arc::new(SharedState::default()),
            );
            let conn = Arc::new(dispatcher.new_connection());
            let (outbound, responses) = mpsc::channel(OUTBOUND_DEPTH);
            Self {
                worker: Worker {
                    dispatcher,
                    conn,
                    outbound,
                    closed: Arc::new(AtomicBool::new(false)),
                },
                lanes: HashMap::new(),
                tasks: JoinSet::new(),
                responses,
                next: 0,
            }
        }

        async fn send(&mut self, request: Request) -> u64 {
            self.next += 1;
            route(
                &self.worker,
                &mut self.lanes,
                &mut self.tasks,
                self.next,
                request,
            )
            .await;
            self.next
        }

        async fn recv(&mut self) -> Response {
            tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
                .await
                .expect("response in time")
                .expect("outbound open")
        }

        async fn call(&mut self, request: Request) -> Response {
            self.send(request).await;
            self.recv().await
        }

        async fn open(&mut self) -> u64 {
            let response = self
                .call(Request::OpenSession {
                    slot: 0,
                    flags: (CKF_SERIAL_SESSION | CKF_RW_SESSION) as u64,
                })
                .await;
            match response.reply {
                Reply::Session { session } => session,
                other => panic!("open session: {other:?}"),
            }
        }

        /// Waits for finished lane tasks to be collected.
        async fn live_tasks(&mut self, expected: usize) -> usize {
            for _ in 0..100 {
                while self.tasks.try_join_next().is_some() {}
                if self.tasks.len() <= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.tasks.len()
        }
    }

    #[tokio::test]
    async fn lanes_end_with_sessions_closed_together() {
        let mut h = Harness::new();
        for _ in 0..20 {
            let session = h.open().await;
            assert_eq!(h.call(Request::GetSessionInfo { session }).await.rv, OK);
            assert_eq!(h.call(Request::CloseAllSessions { slot: 0 }).await.rv, OK);
        }
        assert_eq!(h.call(Request::GetInfo).await.rv, OK);

        assert_eq!(h.lanes.len(), 1);
        assert!(h.lanes.contains_key(&None));
        assert_eq!(h.live_tasks(1).await, 1);
    }

    #[tokio::test]
    async fn requests_on_one_session_run_in_arrival_order() {
        let mut h = Harness::new();
        let session = h.open().await;
        let login = h
            .call(Request::Login {
                session,
                user_type: CKU_USER as u64,
                pin: b"1234".to_vec(),
            })
            .await;
        assert_eq!(login.rv, OK);
        let key_value = vec![9u8; 32];
        let created = h
            .call(Request::CreateObject {
                session,
                template: vec![
                    Attribute::ulong(CKA_CLASS as u64, CKO_SECRET_KEY as u64),
                    Attribute::new(CKA_VALUE as u64, key_value.clone()),
                    Attribute::bool(CKA_SIGN as u64, true),
                ],
            })
            .await;
        let key = match created.reply {
            Reply::Object { object } => object,
            other => panic!("create object: {other:?}"),
        };

        // Everything is queued before the first answer is read.
        let mut sent = vec![
            h.send(Request::SignInit {
                session,
                mechanism: Mechanism::new(CKM_SHA256_HMAC as u64),
                key,
            })
            .await,
        ];
        for part in [b"first ".as_slice(), b"second ", b"third"] {
            sent.push(
                h.send(Request::SignUpdate {
                    session,
                    data: part.to_vec(),
                })
                .await,
            );
        }
        sent.push(
            h.send(Request::SignFinal {
                session,
                capacity: Some(64),
            })
            .await,
        );

        let mut received = Vec::new();
        let mut signature = None;
        for _ in 0..sent.len() {
            let response = h.recv().await;
            assert_eq!(response.rv, OK, "request {}", response.correlation);
            received.push(response.correlation);
            if let Reply::Output(out) = response.reply {
                signature = out.data;
            }
        }
        assert_eq!(received, sent);

        let mut mac = Hmac::<Sha256>::new_from_slice(&key_value).expect("key");
        mac.update(b"first second third");
        assert_eq!(signature, Some(mac.finalize().into_bytes().to_vec()));
    }
}
