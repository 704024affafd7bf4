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

use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use podtunnel::portforward::{self, PortSpec};
use podtunnel::resolve::{ApiResolver, Error, PodRef, PodResolver};
use podtunnel::test_helpers::apiserver::{MockApiServer, MockHandle};
use podtunnel::test_helpers::echo::TestServer;
use podtunnel::test_helpers::*;

const NAMESPACE: &str = "observability";

async fn cluster() -> MockHandle {
    let upstream = TestServer::new().await.with_greeting(b"jaeger").spawn();
    MockApiServer::new(NAMESPACE)
        .with_pod("jaeger-7f9c", "jaegertracing/all-in-one:1.57", &[(16686, upstream)])
        .with_pod("jaeger-agent-x2", "jaegertracing/jaeger-agent:1.57", &[])
        .with_pod("order-5d8", "example/order:v1", &[])
        .spawn()
        .await
}

#[tokio::test]
async fn resolves_single_match() {
    helpers::initialize_telemetry();
    let api = cluster().await;
    let resolver = ApiResolver::new(test_config(api.address()).cluster);
    let pod = resolver
        .resolve(NAMESPACE, "jaeger", "all-in-one")
        .await
        .unwrap();
    assert_eq!(pod, PodRef::new(NAMESPACE, "jaeger-7f9c"));
}

#[tokio::test]
async fn reports_missing_and_ambiguous() {
    helpers::initialize_telemetry();
    let api = cluster().await;
    let resolver = ApiResolver::new(test_config(api.address()).cluster);

    let err = resolver
        .resolve(NAMESPACE, "jaeger", "zipkin")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "unexpected error {err}");

    // Pods in other namespaces are never considered.
    let err = resolver
        .resolve("default", "jaeger", "all-in-one")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "unexpected error {err}");

    match resolver.resolve(NAMESPACE, "jaeger", "jaegertracing").await {
        Err(Error::Ambiguous { candidates, .. }) => {
            assert_eq!(candidates, vec!["jaeger-7f9c", "jaeger-agent-x2"]);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn api_errors_carry_status() {
    helpers::initialize_telemetry();
    let api = MockApiServer::new(NAMESPACE)
        .with_token("s3cr3t")
        .spawn()
        .await;
    let resolver = ApiResolver::new(test_config(api.address()).cluster);
    match resolver.resolve(NAMESPACE, "jaeger", "all-in-one").await {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(message, "Unauthorized");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_connect_error() {
    helpers::initialize_telemetry();
    let resolver = ApiResolver::new(test_config(helpers::closed_address().await).cluster);
    let err = resolver
        .resolve(NAMESPACE, "jaeger", "all-in-one")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connect(_)), "unexpected error {err}");
}

#[tokio::test]
async fn resolved_pod_can_be_forwarded() {
    helpers::initialize_telemetry();
    let api = cluster().await;
    let cfg = test_config(api.address());
    let pod = ApiResolver::new(cfg.cluster.clone())
        .resolve(NAMESPACE, "jaeger-7", "all-in-one")
        .await
        .unwrap();

    let mut tunnel = portforward::establish(&cfg, &pod, &[PortSpec::remote(16686)], Duration::from_secs(5))
        .await
        .unwrap();
    let mut client = TcpStream::connect(tunnel.local_addr(16686).unwrap())
        .await
        .unwrap();
    let mut greeting = [0; 6];
    client.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting, b"jaeger");
    client.write_all(b"ok").await.unwrap();
    let mut echoed = [0; 2];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ok");
    tunnel.teardown().await;
}
