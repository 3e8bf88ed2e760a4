use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cryptoki_sys::{
    CKA_CLASS, CKA_LABEL, CKA_SIGN, CKA_VALUE, CKA_VERIFY, CKF_RW_SESSION, CKF_SERIAL_SESSION,
    CKM_SHA256_HMAC, CKO_SECRET_KEY, CKR_OK, CKR_SESSION_HANDLE_INVALID,
    CKR_USER_ANOTHER_ALREADY_LOGGED_IN, CKU_USER,
};
use rsc_core::tls::{fingerprint, server_config};
use rsc_core::{Attribute, ClientConfig, Mechanism, RemoteClient, Reply, Request, RscError};
use rsc_server::provider::{MemoryToken, MemoryTokenConfig};
use rsc_server::state::SharedState;
use rsc_server::{ClientRegistry, Server};
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio::sync::oneshot;

const FINGERPRINT: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";
const SECRET: [u8; 32] = [0x42; 32];

struct Harness {
    token: Arc<MemoryToken>,
    shared: Arc<SharedState>,
    addr: String,
    pin: String,
    _shutdown: oneshot::Sender<()>,
}

impl Harness {
    async fn start(config: MemoryTokenConfig) -> Self {
        let certified =
            rcgen::generate_simple_self_signed(["localhost".into()]).expect("generate cert");
        let pin = fingerprint(certified.cert.der());
        let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into();
        let tls = server_config(vec![certified.cert.der().clone()], key).expect("tls");
        let registry =
            ClientRegistry::single(FINGERPRINT, &STANDARD.encode(SECRET)).expect("registry");

        let token = Arc::new(MemoryToken::new(config));
        let server = Server::bind("127.0.0.1:0", tls, registry, token.clone())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("addr").to_string();
        let shared = server.shared();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(server.run(async move {
            let _ = rx.await;
        }));
        Self {
            token,
            shared,
            addr,
            pin,
            _shutdown: tx,
        }
    }

    fn config(&self, fingerprint: &str, secret: &[u8]) -> ClientConfig {
        let mut config =
            ClientConfig::new(&self.addr, &self.pin, fingerprint, &STANDARD.encode(secret))
                .expect("config");
        config.retries = 0;
        config.timeout = Duration::from_secs(5);
        config
    }

    async fn client(&self) -> RemoteClient {
        RemoteClient::connect(self.config(FINGERPRINT, &SECRET))
            .await
            .expect("connect")
    }
}

async fn call(client: &RemoteClient, request: Request) -> (u64, Reply) {
    let response = client.call(request).await.expect("call");
    (response.rv, response.reply)
}

async fn open(client: &RemoteClient) -> u64 {
    match call(
        client,
        Request::OpenSession {
            slot: 0,
            flags: (CKF_SERIAL_SESSION | CKF_RW_SESSION) as u64,
        },
    )
    .await
    {
        (0, Reply::Session { session }) => session,
        other => panic!("open session: {other:?}"),
    }
}

async fn open_logged_in(client: &RemoteClient) -> u64 {
    let session = open(client).await;
    let (rv, _) = call(
        client,
        Request::Login {
            session,
            user_type: CKU_USER as u64,
            pin: b"1234".to_vec(),
        },
    )
    .await;
    assert_eq!(rv, CKR_OK as u64);
    session
}

async fn start_signing(client: &RemoteClient, session: u64) {
    let template = vec![
        Attribute::ulong(CKA_CLASS as u64, CKO_SECRET_KEY as u64),
        Attribute::new(CKA_LABEL as u64, b"hmac".to_vec()),
        Attribute::new(CKA_VALUE as u64, vec![1u8; 32]),
        Attribute::bool(CKA_SIGN as u64, true),
        Attribute::bool(CKA_VERIFY as u64, true),
    ];
    let key = match call(client, Request::CreateObject { session, template }).await {
        (0, Reply::Object { object }) => object,
        other => panic!("create key: {other:?}"),
    };
    let (rv, _) = call(
        client,
        Request::SignInit {
            session,
            mechanism: Mechanism::new(CKM_SHA256_HMAC as u64),
            key,
        },
    )
    .await;
    assert_eq!(rv, CKR_OK as u64);
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn library_info_and_slots_come_from_the_provider() {
    let harness = Harness::start(MemoryTokenConfig::default()).await;
    let client = harness.client().await;

    match call(&client, Request::GetInfo).await {
        (0, Reply::Info(info)) => {
            assert_eq!(info.manufacturer, "SoftHSM");
            assert_eq!(info.description, "Implementation of PKCS11");
        }
        other => panic!("get info: {other:?}"),
    }
    match call(
        &client,
        Request::GetSlotList {
            token_present: true,
        },
    )
    .await
    {
        (0, Reply::Slots { slots }) => assert_eq!(slots.len(), 1),
        other => panic!("slot list: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_clients_never_reach_the_provider() {
    let harness = Harness::start(MemoryTokenConfig::default()).await;

    let err = RemoteClient::connect(harness.config(FINGERPRINT, &[0x24; 32]))
        .await
        .expect_err("wrong secret");
    assert!(matches!(err, RscError::Auth(_)));

    let err = RemoteClient::connect(harness.config("ffffffffffffffffffffffffffffffff", &SECRET))
        .await
        .expect_err("unknown fingerprint");
    assert!(matches!(err, RscError::Auth(_)));

    assert_eq!(harness.token.invocations(), 0);
}

#[tokio::test]
async fn connections_cannot_use_each_others_handles_or_login() {
    let harness = Harness::start(MemoryTokenConfig::default()).await;
    let a = harness.client().await;
    let b = harness.client().await;

    let session = open_logged_in(&a).await;
    let (rv, _) = call(&b, Request::GetSessionInfo { session }).await;
    assert_eq!(rv, CKR_SESSION_HANDLE_INVALID as u64);

    let other = open(&b).await;
    let (rv, _) = call(
        &b,
        Request::Login {
            session: other,
            user_type: CKU_USER as u64,
            pin: b"1234".to_vec(),
        },
    )
    .await;
    assert_eq!(rv, CKR_USER_ANOTHER_ALREADY_LOGGED_IN as u64);
}

#[tokio::test]
async fn slow_sessions_do_not_hold_up_others() {
    let harness = Harness::start(MemoryTokenConfig {
        sign_delay: Duration::from_millis(400),
        thread_safe: true,
        ..MemoryTokenConfig::default()
    })
    .await;
    let client = Arc::new(harness.client().await);
    let signing = open_logged_in(&client).await;
    start_signing(&client, signing).await;
    let other = open(&client).await;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(Request::Sign {
                    session: signing,
                    data: b"slow".to_vec(),
                    capacity: Some(32),
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    match call(&client, Request::GenerateRandom { session: other, len: 16 }).await {
        (0, Reply::Random { data }) => assert_eq!(data.len(), 16),
        other => panic!("random: {other:?}"),
    }
    assert!(!slow.is_finished());
    let response = slow.await.expect("join").expect("sign");
    assert_eq!(response.rv, CKR_OK as u64);
}

#[tokio::test]
async fn disconnect_mid_sign_closes_the_provider_session() {
    let harness = Harness::start(MemoryTokenConfig {
        sign_delay: Duration::from_millis(300),
        ..MemoryTokenConfig::default()
    })
    .await;
    let client = Arc::new(harness.client().await);
    let session = open_logged_in(&client).await;
    start_signing(&client, session).await;
    assert_eq!(harness.token.open_sessions(), 1);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call(Request::Sign {
                    session,
                    data: b"interrupted".to_vec(),
                    capacity: Some(32),
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close().await;

    let result = pending.await.expect("join");
    assert!(matches!(result, Err(RscError::ConnectionLost)));
    assert!(eventually(|| harness.token.open_sessions() == 0).await);
    assert_eq!(harness.token.logged_in(), None);
    assert_eq!(harness.shared.login_owner(0), None);
}
