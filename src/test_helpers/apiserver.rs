// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal API server: pod listing and the port-forward upgrade.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, warn};

use crate::portforward::channel::{data_channel, error_channel, frame, split_frame};
use crate::portforward::{CHANNEL_PROTOCOL, PORTS_PARAM};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Upgrades and serves port-forward sessions.
    Normal,
    /// Upgrades, then never speaks: ports are never opened and pings go unanswered.
    Silent,
    /// Upgrades, then drops the connection straight away.
    Hangup,
}

#[derive(Clone, Debug)]
struct MockPod {
    image: String,
    /// Pod port to the local address standing in for it.
    ports: HashMap<u16, SocketAddr>,
}

struct State {
    namespace: String,
    pods: HashMap<String, MockPod>,
    token: Option<String>,
    mode: Mode,
    sever: watch::Receiver<bool>,
    upgrades: AtomicUsize,
}

pub struct MockApiServer {
    namespace: String,
    pods: HashMap<String, MockPod>,
    token: Option<String>,
    mode: Mode,
}

impl MockApiServer {
    pub fn new(namespace: &str) -> Self {
        MockApiServer {
            namespace: namespace.to_string(),
            pods: HashMap::new(),
            token: None,
            mode: Mode::Normal,
        }
    }

    /// Adds a pod whose ports are served by the given local addresses.
    pub fn with_pod(mut self, name: &str, image: &str, ports: &[(u16, SocketAddr)]) -> Self {
        self.pods.insert(
            name.to_string(),
            MockPod {
                image: image.to_string(),
                ports: ports.iter().copied().collect(),
            },
        );
        self
    }

    /// Requires `Authorization: Bearer {token}` on every request.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub async fn spawn(self) -> MockHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (sever_tx, sever_rx) = watch::channel(false);
        let state = Arc::new(State {
            namespace: self.namespace,
            pods: self.pods,
            token: self.token,
            mode: self.mode,
            sever: sever_rx,
            upgrades: AtomicUsize::new(0),
        });
        let task = tokio::spawn({
            let state = state.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let state = state.clone();
                            async move { Ok::<_, Infallible>(handle(state, req).await) }
                        });
                        if let Err(e) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!("mock api connection ended: {e}");
                        }
                    });
                }
            }
        });
        MockHandle {
            address,
            sever: sever_tx,
            state,
            task,
        }
    }
}

pub struct MockHandle {
    address: SocketAddr,
    sever: watch::Sender<bool>,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Abruptly closes every upgraded connection, current and future.
    pub fn sever(&self) {
        self.sever.send_replace(true);
    }

    /// Number of port-forward upgrades accepted so far.
    pub fn upgrades(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn status(code: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": message,
        "code": code.as_u16(),
    });
    Response::builder()
        .status(code)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn handle(state: Arc<State>, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
    if let Some(token) = &state.token {
        let expected = format!("Bearer {token}");
        if req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) != Some(&expected) {
            return status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }

    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    match (req.method().clone(), segments.as_slice()) {
        (Method::GET, ["api", "v1", "namespaces", ns, "pods"]) => list_pods(&state, ns),
        (Method::GET, ["api", "v1", "namespaces", ns, "pods", name, "portforward"]) => {
            let pod = match state.pods.get(*name) {
                Some(pod) if *ns == state.namespace => pod.clone(),
                _ => return status(StatusCode::NOT_FOUND, &format!("pods \"{name}\" not found")),
            };
            let header = |name: http::header::HeaderName| req.headers().get(name).and_then(|v| v.to_str().ok());
            let websocket = header(UPGRADE).is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
            let protocol = header(SEC_WEBSOCKET_PROTOCOL)
                .is_some_and(|v| v.split(',').any(|p| p.trim() == CHANNEL_PROTOCOL));
            let Some(key) = header(SEC_WEBSOCKET_KEY).filter(|_| websocket && protocol) else {
                return status(StatusCode::BAD_REQUEST, "unable to upgrade: missing upgrade headers");
            };
            let accept = derive_accept_key(key.as_bytes());
            let ports = match requested_ports(req.uri().query().unwrap_or_default()) {
                Ok(ports) => ports,
                Err(message) => return status(StatusCode::BAD_REQUEST, &message),
            };

            let on_upgrade = hyper::upgrade::on(&mut req);
            state.upgrades.fetch_add(1, Ordering::SeqCst);
            let mode = state.mode;
            let mut sever = state.sever.clone();
            tokio::spawn(async move {
                let io = match on_upgrade.await {
                    Ok(upgraded) => TokioIo::new(upgraded),
                    Err(e) => {
                        warn!("mock api upgrade failed: {e}");
                        return;
                    }
                };
                match mode {
                    Mode::Hangup => drop(io),
                    Mode::Silent => {
                        let _ = sever.wait_for(|s| *s).await;
                        drop(io);
                    }
                    Mode::Normal => serve_session(io, ports, pod.ports, sever).await,
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(CONNECTION, "Upgrade")
                .header(UPGRADE, "websocket")
                .header(SEC_WEBSOCKET_ACCEPT, accept)
                .header(SEC_WEBSOCKET_PROTOCOL, CHANNEL_PROTOCOL)
                .body(Full::default())
                .unwrap()
        }
        _ => status(
            StatusCode::NOT_FOUND,
            "the server could not find the requested resource",
        ),
    }
}

fn requested_ports(query: &str) -> Result<Vec<u16>, String> {
    let ports = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(name, _)| *name == PORTS_PARAM)
        .map(|(_, value)| {
            value
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| format!("invalid port {value:?}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if ports.is_empty() {
        return Err("at least one port must be specified".to_string());
    }
    Ok(ports)
}

fn list_pods(state: &State, namespace: &str) -> Response<Full<Bytes>> {
    let items: Vec<_> = if namespace == state.namespace {
        state
            .pods
            .iter()
            .map(|(name, pod)| {
                json!({
                    "metadata": {"name": name, "namespace": namespace},
                    "spec": {"containers": [{"name": "main", "image": pod.image}]},
                    "status": {"phase": "Running"},
                })
            })
            .collect()
    } else {
        Vec::new()
    };
    let body = json!({"kind": "PodList", "apiVersion": "v1", "items": items});
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Serves one session the way the kubelet does: every requested port is dialed, every
/// channel is opened with its port, and dial failures are reported on the error
/// channel. The session closes once every port is done.
async fn serve_session<IO>(
    io: IO,
    ports: Vec<u16>,
    pod_ports: HashMap<u16, SocketAddr>,
    mut sever: watch::Receiver<bool>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if *sever.borrow() {
        return;
    }
    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    let (mut sink, mut stream) = ws.split();

    let mut upstreams = Vec::with_capacity(ports.len());
    for port in &ports {
        let upstream = match pod_ports.get(port) {
            Some(addr) => TcpStream::connect(addr).await.ok(),
            None => None,
        };
        upstreams.push(upstream);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (i, port) in ports.iter().enumerate() {
        let _ = tx.send(frame(data_channel(i), &port.to_le_bytes()));
        let _ = tx.send(frame(error_channel(i), &port.to_le_bytes()));
    }
    let mut tasks = JoinSet::new();
    let mut writers = Vec::with_capacity(ports.len());
    for (i, (port, upstream)) in ports.iter().zip(upstreams).enumerate() {
        match upstream {
            Some(upstream) => {
                let (read, write) = upstream.into_split();
                writers.push(Some(write));
                tasks.spawn(pump(read, data_channel(i), tx.clone()));
            }
            None => {
                let message = format!(
                    "error forwarding port {port} to pod: dial tcp4 127.0.0.1:{port}: connect: connection refused"
                );
                let _ = tx.send(frame(error_channel(i), message.as_bytes()));
                writers.push(None);
            }
        }
    }
    drop(tx);
    tasks.spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let Some((channel, payload)) = split_frame(&data) else {
                        continue;
                    };
                    let index = usize::from(channel / 2);
                    if channel % 2 != 0 {
                        continue;
                    }
                    let failed = match writers.get_mut(index) {
                        Some(Some(write)) => write.write_all(payload).await.is_err(),
                        _ => false,
                    };
                    if failed {
                        writers[index] = None;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = async { sever.wait_for(|s| *s).await.is_ok() } => {
                debug!("severing mock session");
                return;
            }
        }
    }

    // The client is done sending; the pod side still gets to finish.
    for write in writers.iter_mut().flatten() {
        let _ = write.shutdown().await;
    }
    drop(writers);
    tokio::select! {
        _ = async { while tasks.join_next().await.is_some() {} } => {}
        _ = sever.wait_for(|s| *s) => debug!("severing mock session"),
    }
}

async fn pump(mut read: OwnedReadHalf, channel: u8, tx: mpsc::UnboundedSender<Message>) {
    let mut buf = vec![0; 16 * 1024];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(frame(channel, &buf[..n])).is_err() {
                    return;
                }
            }
        }
    }
}
