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

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Empty, Full};
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use podtunnel::config::Credential;
use podtunnel::portforward::{self, Error, PortSpec, Readiness, Tunnel};
use podtunnel::resolve::PodRef;
use podtunnel::test_helpers::apiserver::{MockApiServer, Mode};
use podtunnel::test_helpers::echo::TestServer;
use podtunnel::test_helpers::*;
use podtunnel::wait;

const NAMESPACE: &str = "observability";
const POD: &str = "jaeger-7f9c";
const IMAGE: &str = "jaegertracing/all-in-one:1.57";

fn target() -> PodRef {
    PodRef::new(NAMESPACE, POD)
}

async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0; n];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

async fn read_eof(stream: &mut TcpStream) {
    let mut buf = [0; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(n, 0, "expected EOF");
}

async fn echo_tunnel(remote: u16) -> (podtunnel::test_helpers::apiserver::MockHandle, Tunnel) {
    let upstream = TestServer::new().await.spawn();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(remote, upstream)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let tunnel = portforward::establish(&cfg, &target(), &[PortSpec::remote(remote)], cfg.ready_timeout)
        .await
        .unwrap();
    (api, tunnel)
}

#[tokio::test]
async fn forwards_bytes_both_ways() {
    helpers::initialize_telemetry();
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, upstream.local_addr().unwrap())])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = portforward::establish(
        &cfg,
        &target(),
        &[PortSpec::remote(16686)],
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(tunnel.readiness(), Readiness::Ready);
    // Only the control session so far. It holds a pod connection of its own.
    assert_eq!(api.upgrades(), 1);
    let (_idle, _) = timeout(Duration::from_secs(5), upstream.accept())
        .await
        .unwrap()
        .unwrap();
    let local = tunnel.local_addr(16686).unwrap();
    assert!(local.ip().is_loopback());
    assert_ne!(local.port(), 0);

    for _ in 0..2 {
        let mut client = TcpStream::connect(local).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let (mut pod_side, _) = timeout(Duration::from_secs(5), upstream.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_exact(&mut pod_side, 5).await, b"hello");
        pod_side.write_all(b"world").await.unwrap();
        assert_eq!(read_exact(&mut client, 5).await, b"world");

        // Closing the client closes the pod side, and then the client sees EOF.
        client.shutdown().await.unwrap();
        read_eof(&mut pod_side).await;
        drop(pod_side);
        read_eof(&mut client).await;
    }

    // Each connection got a session of its own next to the control session.
    assert_eq!(api.upgrades(), 3);
    assert!(tunnel.fault().is_none());
    tunnel.teardown().await;
}

#[tokio::test]
async fn forwards_large_payloads() {
    helpers::initialize_telemetry();
    let (_api, mut tunnel) = echo_tunnel(8080).await;
    let mut client = TcpStream::connect(tunnel.local_addr(8080).unwrap())
        .await
        .unwrap();
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut read, mut write) = client.split();
    let writer = async {
        write.write_all(&payload).await.unwrap();
    };
    let reader = async {
        let mut got = vec![0; payload.len()];
        read.read_exact(&mut got).await.unwrap();
        got
    };
    let ((), got) = timeout(Duration::from_secs(10), async { tokio::join!(writer, reader) })
        .await
        .unwrap();
    assert!(got == payload);
    tunnel.teardown().await;
}

#[tokio::test]
async fn multiple_ports_get_distinct_bindings() {
    helpers::initialize_telemetry();
    let query = TestServer::new().await.with_greeting(b"query").spawn();
    let collector = TestServer::new().await.with_greeting(b"otlp!").spawn();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, query), (4317, collector)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let pinned = helpers::unused_port().await;
    let ports = [PortSpec::remote(16686), PortSpec::pinned(pinned, 4317)];
    let mut tunnel = portforward::establish(&cfg, &target(), &ports, Duration::from_secs(5))
        .await
        .unwrap();

    let bindings = tunnel.bindings().to_vec();
    assert_eq!(bindings.len(), 2);
    assert_eq!(bindings[0].remote, 16686);
    assert_eq!(bindings[1].remote, 4317);
    assert_eq!(bindings[1].local.port(), pinned);
    assert_ne!(bindings[0].local, bindings[1].local);

    let mut a = TcpStream::connect(bindings[0].local).await.unwrap();
    let mut b = TcpStream::connect(bindings[1].local).await.unwrap();
    assert_eq!(read_exact(&mut a, 5).await, b"query");
    assert_eq!(read_exact(&mut b, 5).await, b"otlp!");
    a.write_all(b"ping").await.unwrap();
    assert_eq!(read_exact(&mut a, 4).await, b"ping");

    tunnel.teardown().await;
    assert!(helpers::can_bind(bindings[1].local).await);
}

#[tokio::test]
async fn unknown_pod_fails_upgrade() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE).spawn().await;
    let cfg = test_config(api.address());
    let pinned = helpers::unused_port().await;
    let err = portforward::establish(
        &cfg,
        &target(),
        &[PortSpec::pinned(pinned, 16686)],
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();
    match err {
        Error::UpgradeFailed {
            status, reason, ..
        } => {
            assert_eq!(status, Some(StatusCode::NOT_FOUND));
            assert_eq!(reason, format!("pods \"{POD}\" not found"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(api.upgrades(), 0);
    assert!(helpers::can_bind(SocketAddr::from(([127, 0, 0, 1], pinned))).await);
}

#[tokio::test]
async fn rejected_credentials_fail_upgrade() {
    helpers::initialize_telemetry();
    let upstream = TestServer::new().await.spawn();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, upstream)])
        .with_token("s3cr3t")
        .spawn()
        .await;

    let mut cfg = test_config(api.address());
    let err = Tunnel::start(&cfg, &target(), &[PortSpec::remote(16686)])
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::UpgradeFailed {
                status: Some(StatusCode::UNAUTHORIZED),
                ..
            }
        ),
        "unexpected error {err}"
    );

    cfg.cluster.credential = Credential::Token("s3cr3t".to_string());
    let mut tunnel = portforward::establish(&cfg, &target(), &[PortSpec::remote(16686)], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(api.upgrades(), 1);
    tunnel.teardown().await;
}

#[tokio::test]
async fn unreachable_server_fails_upgrade() {
    helpers::initialize_telemetry();
    let cfg = test_config(helpers::closed_address().await);
    let err = Tunnel::start(&cfg, &target(), &[PortSpec::remote(16686)])
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::UpgradeFailed { status: None, .. }),
        "unexpected error {err}"
    );
}

#[tokio::test]
async fn invalid_ports_are_rejected_before_connecting() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE).spawn().await;
    let cfg = test_config(api.address());
    for ports in [
        vec![],
        vec![PortSpec::remote(0)],
        vec![PortSpec::remote(80), PortSpec::remote(80)],
    ] {
        let err = Tunnel::start(&cfg, &target(), &ports).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPorts(_)), "unexpected error {err}");
    }
    assert_eq!(api.upgrades(), 0);
}

#[tokio::test]
async fn occupied_local_port_fails_bind() {
    helpers::initialize_telemetry();
    let upstream = TestServer::new().await.spawn();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, upstream), (4317, upstream)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap().port();
    let free = helpers::unused_port().await;

    let err = Tunnel::start(
        &cfg,
        &target(),
        &[PortSpec::pinned(free, 16686), PortSpec::pinned(taken, 4317)],
    )
    .await
    .unwrap_err();
    match err {
        Error::BindFailed { addr, remote, .. } => {
            assert_eq!(addr.port(), taken);
            assert_eq!(remote, 4317);
        }
        other => panic!("unexpected error {other}"),
    }
    // The control session was opened first, and the listener bound before the failure is gone.
    assert_eq!(api.upgrades(), 1);
    assert!(helpers::can_bind(SocketAddr::from(([127, 0, 0, 1], free))).await);
}

#[tokio::test]
async fn unresponsive_session_times_out() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[])
        .with_mode(Mode::Silent)
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let pinned = helpers::unused_port().await;
    let wait = Duration::from_millis(300);

    let start = std::time::Instant::now();
    let err = portforward::establish(&cfg, &target(), &[PortSpec::pinned(pinned, 16686)], wait)
        .await
        .unwrap_err();
    match err {
        Error::ReadyTimeout { timeout, target: t } => {
            assert_eq!(timeout, wait);
            assert_eq!(t, target());
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(start.elapsed() >= wait);
    assert!(start.elapsed() < Duration::from_secs(5));
    // The failed tunnel was torn down before the error was returned.
    assert!(helpers::can_bind(SocketAddr::from(([127, 0, 0, 1], pinned))).await);
}

#[tokio::test]
async fn teardown_before_ready_is_prompt() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[])
        .with_mode(Mode::Silent)
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = Tunnel::start(&cfg, &target(), &[PortSpec::remote(16686)])
        .await
        .unwrap();
    assert_eq!(tunnel.readiness(), Readiness::Pending);
    let local = tunnel.local_addr(16686).unwrap();

    timeout(Duration::from_secs(1), tunnel.teardown())
        .await
        .expect("teardown should not wait for readiness");
    assert!(tunnel.is_stopped());
    assert!(helpers::can_bind(local).await);
}

#[tokio::test]
async fn wait_ready_after_teardown_is_an_error() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[])
        .with_mode(Mode::Silent)
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = Tunnel::start(&cfg, &target(), &[PortSpec::remote(16686)])
        .await
        .unwrap();
    tunnel.teardown().await;

    // The tunnel never became ready, so waiting must not report success.
    let err = timeout(Duration::from_secs(1), tunnel.wait_ready(Duration::from_secs(5)))
        .await
        .expect("a stopped tunnel answers at once")
        .unwrap_err();
    match err {
        Error::Establish { reason, .. } => {
            assert_eq!(reason, "tunnel stopped before becoming ready");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(tunnel.readiness(), Readiness::Pending);
}

#[tokio::test]
async fn session_dropped_before_ready_fails_establish() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[])
        .with_mode(Mode::Hangup)
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let pinned = helpers::unused_port().await;

    let err = portforward::establish(
        &cfg,
        &target(),
        &[PortSpec::pinned(pinned, 16686)],
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();
    match err {
        Error::Establish { target: t, reason } => {
            assert_eq!(t, target());
            assert!(!reason.is_empty());
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(api.upgrades(), 1);
    // The failed tunnel released its listener.
    assert!(helpers::can_bind(SocketAddr::from(([127, 0, 0, 1], pinned))).await);
}

#[tokio::test]
async fn stalled_error_response_fails_promptly() {
    helpers::initialize_telemetry();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = [0; 4096];
        let _ = stream.read(&mut request).await;
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 100\r\n\r\nstall!")
            .await
            .unwrap();
        // The rest of the body never comes.
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let mut cfg = test_config(address);
    cfg.cluster.connect_timeout = Duration::from_millis(500);
    let start = std::time::Instant::now();
    let err = timeout(
        Duration::from_secs(5),
        portforward::establish(&cfg, &target(), &[PortSpec::remote(16686)], Duration::from_secs(1)),
    )
    .await
    .expect("establish hung on the response body")
    .unwrap_err();
    match err {
        Error::UpgradeFailed { status, reason, .. } => {
            assert_eq!(status, Some(StatusCode::NOT_FOUND));
            assert_eq!(reason, "stall!");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn teardown_is_idempotent() {
    helpers::initialize_telemetry();
    let (_api, mut tunnel) = echo_tunnel(16686).await;
    let local = tunnel.local_addr(16686).unwrap();
    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"x").await.unwrap();
    assert_eq!(read_exact(&mut client, 1).await, b"x");

    tunnel.teardown().await;
    assert!(tunnel.is_stopped());
    assert!(helpers::can_bind(local).await);
    // In-flight connections are closed too.
    let mut buf = [0; 1];
    let res = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(res, Ok(0) | Err(_)));

    timeout(Duration::from_secs(1), tunnel.teardown())
        .await
        .expect("second teardown returns immediately");
    assert!(tunnel.fault().is_none());
}

#[tokio::test]
async fn stop_handle_stops_without_fault() {
    helpers::initialize_telemetry();
    let (_api, mut tunnel) = echo_tunnel(16686).await;
    let local = tunnel.local_addr(16686).unwrap();

    let stop = tunnel.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.start_drain();
    });
    let fault = timeout(Duration::from_secs(5), tunnel.faulted()).await.unwrap();
    assert!(fault.is_none());
    assert!(tunnel.is_stopped());

    tunnel.teardown().await;
    assert!(helpers::can_bind(local).await);
}

#[tokio::test]
async fn severed_session_reports_fault() {
    helpers::initialize_telemetry();
    let (api, mut tunnel) = echo_tunnel(16686).await;
    let local = tunnel.local_addr(16686).unwrap();

    api.sever();
    let fault = timeout(Duration::from_secs(5), tunnel.faulted())
        .await
        .expect("fault should be reported")
        .expect("tunnel should fault");
    match &fault {
        Error::ForwardingFault { target: t, .. } => assert_eq!(t, &target()),
        other => panic!("unexpected error {other}"),
    }
    assert!(matches!(tunnel.fault(), Some(Error::ForwardingFault { .. })));
    // Readiness does not change after the fact.
    assert_eq!(tunnel.readiness(), Readiness::Ready);

    tunnel.teardown().await;
    assert!(helpers::can_bind(local).await);
}

#[tokio::test]
async fn unreachable_remote_port_closes_connection_only() {
    helpers::initialize_telemetry();
    let upstream = TestServer::new().await.spawn();
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, upstream)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = portforward::establish(
        &cfg,
        &target(),
        &[PortSpec::remote(16686), PortSpec::remote(9999)],
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let mut refused = TcpStream::connect(tunnel.local_addr(9999).unwrap())
        .await
        .unwrap();
    read_eof(&mut refused).await;

    // The session is unaffected.
    let mut ok = TcpStream::connect(tunnel.local_addr(16686).unwrap())
        .await
        .unwrap();
    ok.write_all(b"still here").await.unwrap();
    assert_eq!(read_exact(&mut ok, 10).await, b"still here");
    assert!(tunnel.fault().is_none());
    assert!(!tunnel.is_stopped());

    tunnel.teardown().await;
}

/// Serves a trace search endpoint that finds nothing for the first `empty` requests.
async fn trace_query_server(empty: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |_req| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let body = if n < empty {
                        r#"{"data":[]}"#
                    } else {
                        r#"{"data":[{"traceID":"4bf92f3577b34da6"}]}"#
                    };
                    async move {
                        Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from(body))))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, requests)
}

#[tokio::test]
async fn poll_for_traces_through_tunnel() {
    helpers::initialize_telemetry();
    let (query, requests) = trace_query_server(2).await;
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, query)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = portforward::establish(&cfg, &target(), &[PortSpec::remote(16686)], Duration::from_secs(5))
        .await
        .unwrap();
    let local = tunnel.local_addr(16686).unwrap();

    let client: Client<_, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let uri: http::Uri = format!("http://{local}/api/traces?service=order")
        .parse()
        .unwrap();
    let found = |body: serde_json::Value| {
        body["data"].as_array().is_some_and(|traces| !traces.is_empty())
    };
    wait::poll(Duration::from_millis(20), Duration::from_secs(5), || {
        let client = client.clone();
        let uri = uri.clone();
        async move {
            let res = client.get(uri).await?;
            let body = res.into_body().collect().await?.to_bytes();
            let body: serde_json::Value = serde_json::from_slice(&body)?;
            Ok::<_, anyhow::Error>(found(body))
        }
    })
    .await
    .unwrap();
    assert_eq!(requests.load(Ordering::SeqCst), 3);

    tunnel.teardown().await;
}

#[tokio::test]
async fn poll_times_out_when_condition_never_holds() {
    helpers::initialize_telemetry();
    let (query, requests) = trace_query_server(usize::MAX).await;
    let api = MockApiServer::new(NAMESPACE)
        .with_pod(POD, IMAGE, &[(16686, query)])
        .spawn()
        .await;
    let cfg = test_config(api.address());
    let mut tunnel = portforward::establish(&cfg, &target(), &[PortSpec::remote(16686)], Duration::from_secs(5))
        .await
        .unwrap();
    let local = tunnel.local_addr(16686).unwrap();
    let client: Client<_, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    let res = wait::poll(Duration::from_millis(50), Duration::from_millis(300), || {
        let client = client.clone();
        async move {
            let res = client
                .get(format!("http://{local}/api/traces").parse()?)
                .await?;
            let body = res.into_body().collect().await?.to_bytes();
            Ok::<_, anyhow::Error>(body.as_ref() != br#"{"data":[]}"#)
        }
    })
    .await;
    match res {
        Err(wait::Error::Timeout { attempts, .. }) => {
            assert!(attempts >= 2);
            assert_eq!(requests.load(Ordering::SeqCst), attempts as usize);
        }
        other => panic!("unexpected result {other:?}"),
    }
    tunnel.teardown().await;
}
