//! End-to-end tests: a real proxy and a real agent talking over localhost
//! WebSockets, driven by a plain HTTP client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use camlink::protocol::{
    AuthPayload, Envelope, MessageKind, RegisterPayload,
};
use camlink::tunnel::agent;
use camlink::{Config, ProxyState};

const TOKEN: &str = "e2e-secret";

/// Deterministic file contents so range assertions are byte-exact.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn seed_recording(root: &Path, camera: &str, name: &str, len: usize) {
    let dir = root.join(camera).join("merged");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(name), pattern(len)).await.unwrap();
}

async fn spawn_proxy(mut config: Config) -> (SocketAddr, ProxyState) {
    config.auth.device_token = TOKEN.to_string();
    let state = ProxyState::new(Arc::new(config));
    let app = camlink::routes::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn spawn_agent(addr: SocketAddr, device_id: &str, cameras: &[&str], root: &Path) -> JoinHandle<()> {
    let mut config = Config::default();
    config.auth.device_token = TOKEN.to_string();
    config.agent.proxy_url = format!("ws://{addr}/ws/device");
    config.agent.device_id = device_id.to_string();
    config.agent.camera_ids = cameras.iter().map(|c| (*c).to_string()).collect();
    config.agent.recordings_root = root.display().to_string();
    config.agent.reconnect_delay_secs = 1;
    tokio::spawn(agent::run(Arc::new(config)))
}

async fn wait_for_devices(client: &reqwest::Client, addr: SocketAddr, n: u64) {
    for _ in 0..200 {
        if let Ok(resp) = client.get(format!("http://{addr}/health")).send().await {
            let body: Value = resp.json().await.unwrap();
            if body["devices_connected"].as_u64() == Some(n) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("proxy never reported {n} connected devices");
}

/// A hand-driven device connection for tests that need to control the
/// tunnel below the agent's abstraction.
async fn raw_device(
    addr: SocketAddr,
    device_id: &str,
    cameras: &[&str],
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/device"))
        .await
        .unwrap();

    let auth = Envelope::request(
        MessageKind::Auth,
        &AuthPayload {
            token: TOKEN.to_string(),
        },
    )
    .unwrap();
    ws.send(Message::Text(auth.encode().unwrap().into()))
        .await
        .unwrap();

    let reply = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => Envelope::decode(text.as_str()).unwrap(),
        other => panic!("expected AUTH_OK, got {other:?}"),
    };
    assert_eq!(reply.kind, MessageKind::AuthOk);

    let register = Envelope::request(
        MessageKind::Register,
        &RegisterPayload {
            device_id: device_id.to_string(),
            camera_ids: cameras.iter().map(|c| (*c).to_string()).collect(),
        },
    )
    .unwrap();
    ws.send(Message::Text(register.encode().unwrap().into()))
        .await
        .unwrap();
    ws
}

#[tokio::test(flavor = "multi_thread")]
async fn lists_cameras_for_registered_device() {
    let recordings = tempfile::tempdir().unwrap();
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    let body: Value = client
        .get(format!("http://{addr}/cameras"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body,
        json!({
            "cameras": [{"device_id": "pi-a", "camera_id": "cam1"}],
            "total": 1,
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_whole_file() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 10240).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    let resp = client
        .get(format!("http://{addr}/devices/cam1/videos/20231123_14:30.mp4"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "video/mp4");
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.headers()["content-length"], "10240");

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &pattern(10240)[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn range_request_returns_partial_content() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 10240).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;
    let url = format!("http://{addr}/devices/cam1/videos/20231123_14:30.mp4");

    // Bounded range
    let resp = client
        .get(&url)
        .header("Range", "bytes=1024-2047")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 1024-2047/10240");
    assert_eq!(resp.headers()["content-length"], "1024");
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &pattern(10240)[1024..=2047]);

    // Open-ended range
    let resp = client
        .get(&url)
        .header("Range", "bytes=8192-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 8192-10239/10240");
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &pattern(10240)[8192..]);

    // End clamped to EOF
    let resp = client
        .get(&url)
        .header("Range", "bytes=10000-99999")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 10000-10239/10240");
}

#[tokio::test(flavor = "multi_thread")]
async fn head_reports_size_without_a_body() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 10240).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    let resp = client
        .head(format!("http://{addr}/devices/cam1/videos/20231123_14:30.mp4"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "10240");
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_bad_filenames_and_ranges() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 10240).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    // Path traversal: rejected before any tunnel dispatch
    let resp = client
        .get(format!("http://{addr}/devices/cam1/videos/..%2Fetc%2Fpasswd"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let url = format!("http://{addr}/devices/cam1/videos/20231123_14:30.mp4");

    // Multi-range is unsatisfiable
    let resp = client
        .get(&url)
        .header("Range", "bytes=0-10,20-30")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    // Suffix form is malformed
    let resp = client
        .get(&url)
        .header("Range", "bytes=-500")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Start past EOF: the agent reports INVALID_RANGE
    let resp = client
        .get(&url)
        .header("Range", "bytes=20000-30000")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    // Missing file on a live device
    let resp = client
        .get(format!("http://{addr}/devices/cam1/videos/nope.mp4"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Unknown device entirely
    let resp = client
        .get(format!("http://{addr}/devices/ghost/videos"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn lists_videos_newest_first_through_the_tunnel() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 100).await;
    seed_recording(recordings.path(), "cam1", "20231124_09:00.mp4", 200).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    let body: Value = client
        .get(format!("http://{addr}/devices/cam1/videos"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 2);
    assert_eq!(body["page"], 1);
    assert_eq!(body["total_pages"], 1);
    assert_eq!(body["videos"][0]["filename"], "20231124_09:00.mp4");
    assert_eq!(body["videos"][1]["filename"], "20231123_14:30.mp4");

    // Date filter narrows the listing
    let body: Value = client
        .get(format!(
            "http://{addr}/devices/cam1/videos?date=20231123"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 1);
    assert_eq!(body["videos"][0]["filename"], "20231123_14:30.mp4");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_disjoint_ranges_all_match() {
    let recordings = tempfile::tempdir().unwrap();
    seed_recording(recordings.path(), "cam1", "20231123_14:30.mp4", 10240).await;
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let _agent = spawn_agent(addr, "pi-a", &["cam1"], recordings.path());

    let client = reqwest::Client::new();
    wait_for_devices(&client, addr, 1).await;

    let data = pattern(10240);
    let url = format!("http://{addr}/devices/cam1/videos/20231123_14:30.mp4");

    let fetches = (0..50u64).map(|i| {
        let client = client.clone();
        let url = url.clone();
        let expected = data[(i * 200) as usize..(i * 200 + 200) as usize].to_vec();
        async move {
            let start = i * 200;
            let end = start + 199;
            let resp = client
                .get(&url)
                .header("Range", format!("bytes={start}-{end}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 206);
            assert_eq!(
                resp.headers()["content-range"],
                format!("bytes {start}-{end}/10240")
            );
            let body = resp.bytes().await.unwrap();
            assert_eq!(&body[..], &expected[..], "range {start}-{end} mismatched");
        }
    });
    futures_util::future::join_all(fetches).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reregistration_supersedes_the_old_tunnel() {
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let client = reqwest::Client::new();

    let mut first = raw_device(addr, "pi-a", &["cam1"]).await;
    wait_for_devices(&client, addr, 1).await;

    let _second = raw_device(addr, "pi-a", &["cam1", "cam2"]).await;

    // The first tunnel is closed by the proxy within bounded time.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "superseded tunnel was never closed");

    // Still exactly one device, now with the new camera set.
    wait_for_devices(&client, addr, 1).await;
    let body: Value = client
        .get(format!("http://{addr}/cameras"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_device_is_deregistered() {
    let (addr, _state) = spawn_proxy(Config::default()).await;
    let client = reqwest::Client::new();

    let ws = raw_device(addr, "pi-a", &["cam1"]).await;
    wait_for_devices(&client, addr, 1).await;

    drop(ws);
    wait_for_devices(&client, addr, 0).await;

    let resp = client
        .get(format!("http://{addr}/devices/cam1/videos"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn unresponsive_device_times_out_with_504() {
    let mut config = Config::default();
    config.proxy.request_deadline_secs = 1;
    let (addr, _state) = spawn_proxy(config).await;
    let client = reqwest::Client::new();

    // A device that registers but never answers requests.
    let mut ws = raw_device(addr, "pi-a", &["cam1"]).await;
    wait_for_devices(&client, addr, 1).await;
    let silent = tokio::spawn(async move {
        // Keep the socket open, swallow whatever arrives.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let resp = client
        .get(format!("http://{addr}/devices/cam1/videos"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    silent.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_token_is_rejected() {
    let (addr, _state) = spawn_proxy(Config::default()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/device"))
        .await
        .unwrap();
    let auth = Envelope::request(
        MessageKind::Auth,
        &AuthPayload {
            token: "wrong".to_string(),
        },
    )
    .unwrap();
    ws.send(Message::Text(auth.encode().unwrap().into()))
        .await
        .unwrap();

    let reply = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => Envelope::decode(text.as_str()).unwrap(),
        other => panic!("expected AUTH_FAIL, got {other:?}"),
    };
    assert_eq!(reply.kind, MessageKind::AuthFail);

    // And nothing was registered
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["devices_connected"], 0);
}
