// Shared harness: one gateway worker wired to its own mock Redis.
// Not every suite uses every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use gateway::acceptor;
use gateway::channel::ChannelConfig;
use gateway::config::{CoreConfig, GatewayConfig, ServerConfig, TimeoutConfig};
use gateway::worker;
use serde_json::json;
use souk_redis::facade::FacadeConfig;
use souk_redis::session::SessionConfig;
use souk_test_utils::{MockRedisServer, TestClient};
use tokio::sync::watch;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub url: String,
    pub redis: MockRedisServer,
    pub shutdown: watch::Sender<bool>,
    _task: tokio::task::JoinHandle<()>,
}

pub fn base_config(redis_addr: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        schema_version: 1,
        server: ServerConfig {
            bind: "127.0.0.1:0".to_owned(),
            backlog: 16,
            server_name: "souk-test".to_owned(),
        },
        tls: None,
        core: CoreConfig {
            max_posts_on_sub: 50,
            pwd_size: 10,
            allowed_posts: 3,
            post_interval: 1000,
            mms_key: "mms-key".to_owned(),
            mms_host: "http://img.test".to_owned(),
            filenames_count: 5,
        },
        channel: ChannelConfig {
            cleanup_rate: 100,
            max_posts: 1000,
            post_expiration: 3600,
        },
        timeouts: TimeoutConfig {
            handshake: Duration::from_secs(5),
            idle: Duration::from_secs(30),
            login_grace_pongs: 2,
            max_frame_bytes: 1 << 20,
        },
        redis: FacadeConfig {
            session: SessionConfig {
                host: "127.0.0.1".to_owned(),
                port: redis_addr.port(),
                conn_retry_interval: Duration::from_millis(100),
                ..SessionConfig::default()
            },
            ..FacadeConfig::default()
        },
    }
}

pub async fn start() -> TestGateway {
    start_with(|_| {}).await
}

pub async fn start_with(tweak: impl FnOnce(&mut GatewayConfig)) -> TestGateway {
    let redis = MockRedisServer::start().await.expect("mock redis");
    let mut cfg = base_config(redis.addr());
    tweak(&mut cfg);

    let listener = acceptor::bind("127.0.0.1:0".parse().unwrap(), 16).expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(worker::run_gateway(cfg, listener, None, shutdown_rx));

    TestGateway {
        addr,
        url: format!("ws://{addr}"),
        redis,
        shutdown,
        _task: task,
    }
}

impl TestGateway {
    pub async fn client(&self) -> TestClient {
        tokio::time::timeout(Duration::from_secs(5), TestClient::connect(&self.url))
            .await
            .expect("connect timed out")
            .expect("connect failed")
    }
}

/// Register a fresh user; returns (user id, plaintext password).
pub async fn register(client: &mut TestClient) -> (String, String) {
    client
        .send_json(&json!({"cmd": "register"}))
        .await
        .expect("send register");
    let ack = client.recv_cmd("register_ack").await.expect("register_ack");
    assert_eq!(ack["result"], "ok");
    (
        ack["id"].as_str().expect("id").to_owned(),
        ack["password"].as_str().expect("password").to_owned(),
    )
}

pub async fn subscribe_all(client: &mut TestClient) {
    client
        .send_json(&json!({
            "cmd": "subscribe",
            "last_post_id": -1,
            "filters": [],
            "any_of_features": 0,
            "ranges": []
        }))
        .await
        .expect("send subscribe");
    let ack = client.recv_cmd("subscribe_ack").await.expect("subscribe_ack");
    assert_eq!(ack["result"], "ok");
}

pub fn client_post(body: &str) -> serde_json::Value {
    json!({
        "id": -1,
        "from": "",
        "body": body,
        "to": [[], []],
        "filter": 0,
        "features": 0,
        "date": 0,
        "range_values": []
    })
}

/// Poll until `cond` holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within five seconds");
}
