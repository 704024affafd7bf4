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

use bytes::{Bytes, BytesMut};
use http::header::AUTHORIZATION;
use http::{HeaderValue, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use tracing::debug;

use crate::config::{self, ClusterConfig};
use crate::tls;

/// HTTP/1.1 client for the API server. HTTP/1.1 only, since the websocket upgrade
/// needs a connection it can take over.
pub type ApiClient = Client<HttpsConnector<HttpConnector>, Empty<Bytes>>;

// Error bodies are only used for diagnostics, so cap what we keep.
const MAX_ERROR_BODY: usize = 4 * 1024;
// Largest successful response accepted, e.g. the pods of a busy namespace.
const MAX_BODY: usize = 32 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Tls(#[from] tls::Error),
    #[error("{0}")]
    Credential(#[from] config::Error),
    #[error("invalid request to {0}: {1}")]
    InvalidRequest(String, http::Error),
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("reading response body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("no response after {0:?}")]
    Timeout(Duration),
}

pub async fn api_client(cluster: &ClusterConfig) -> Result<ApiClient, Error> {
    let cc = tls::client_config(cluster).await?;
    let mut http = HttpConnector::new();
    http.set_connect_timeout(Some(cluster.connect_timeout));
    http.set_nodelay(true);
    http.enforce_http(false);
    let https: HttpsConnector<HttpConnector> = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(cc)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);
    Ok(Client::builder(hyper_util::rt::TokioExecutor::new())
        // Each request gets its own connection; upgraded ones are never returned to the pool.
        .pool_max_idle_per_host(0)
        .build(https))
}

/// Builds an authenticated, bodiless request for `path` on the API server.
pub fn api_request(
    cluster: &ClusterConfig,
    method: Method,
    path: &str,
) -> Result<Request<Empty<Bytes>>, Error> {
    let target = format!("{}{}", cluster.server.trim_end_matches('/'), path);
    let mut req = Request::builder()
        .method(method)
        .uri(target.as_str())
        .body(Empty::new())
        .map_err(|e| Error::InvalidRequest(target.clone(), e))?;
    if let Some(token) = cluster.bearer_token()? {
        let mut value = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(|e| Error::InvalidRequest(target.clone(), e.into()))?;
        value.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(req)
}

/// Sends `req`, bounding connect, TLS and response headers by the configured timeout.
pub async fn send(
    client: &ApiClient,
    cluster: &ClusterConfig,
    req: Request<Empty<Bytes>>,
) -> Result<Response<Incoming>, Error> {
    let uri: Uri = req.uri().clone();
    debug!(method = %req.method(), %uri, "sending API request");
    tokio::time::timeout(cluster.connect_timeout, client.request(req))
        .await
        .map_err(|_| Error::Timeout(cluster.connect_timeout))?
        .map_err(Error::Request)
}

/// Reads a whole response body. Bounded in size, and in time by the connect timeout.
pub async fn read_body(cluster: &ClusterConfig, body: Incoming) -> Result<Bytes, Error> {
    let collected = tokio::time::timeout(
        cluster.connect_timeout,
        Limited::new(body, MAX_BODY).collect(),
    )
    .await
    .map_err(|_| Error::Timeout(cluster.connect_timeout))?
    .map_err(Error::Body)?;
    Ok(collected.to_bytes())
}

/// Reads up to `MAX_ERROR_BODY` bytes of an error response. A body that fails or stalls
/// yields whatever arrived before the connect timeout.
pub async fn read_error_body(cluster: &ClusterConfig, body: Incoming) -> Bytes {
    let mut collected = BytesMut::new();
    let read = async {
        let mut body = body;
        while let Some(Ok(frame)) = body.frame().await {
            let Ok(data) = frame.into_data() else {
                continue;
            };
            let room = MAX_ERROR_BODY - collected.len();
            collected.extend_from_slice(&data[..data.len().min(room)]);
            if collected.len() == MAX_ERROR_BODY {
                break;
            }
        }
    };
    if tokio::time::timeout(cluster.connect_timeout, read).await.is_err() {
        debug!(
            received = collected.len(),
            "gave up reading error response body"
        );
    }
    collected.freeze()
}

/// Extracts a human readable reason from an error response body. API servers answer
/// with a `Status` object; anything else is returned as (truncated) text.
pub fn status_message(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct Status {
        message: Option<String>,
    }
    if let Ok(Status { message: Some(m) }) = serde_json::from_slice::<Status>(body) {
        return m;
    }
    let body = &body[..body.len().min(MAX_ERROR_BODY)];
    String::from_utf8_lossy(body).trim().to_string()
}
