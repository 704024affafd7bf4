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

use std::sync::Arc;

use http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderValue, Method, StatusCode};
use hyper::upgrade::Upgraded;
use ::hyper_util::rt::TokioIo;
use itertools::Itertools;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::debug;

use super::{CHANNEL_PROTOCOL, Error, PORTS_PARAM};
use crate::config::{ClusterConfig, Config};
use crate::hyper_util::{self, ApiClient};
use crate::resolve::PodRef;

pub(crate) type SessionIo = TokioIo<Upgraded>;
pub(crate) type WsStream = WebSocketStream<SessionIo>;

/// Opens port-forward sessions to one pod. Clones share the underlying client.
#[derive(Clone)]
pub(crate) struct Connector {
    client: ApiClient,
    cluster: Arc<ClusterConfig>,
    target: PodRef,
    ws_config: WebSocketConfig,
}

impl Connector {
    pub async fn new(cfg: &Config, target: &PodRef) -> Result<Connector, Error> {
        let client = hyper_util::api_client(&cfg.cluster)
            .await
            .map_err(|e| Error::UpgradeFailed {
                target: target.clone(),
                status: None,
                reason: e.to_string(),
            })?;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(cfg.max_message_size);
        ws_config.max_frame_size = Some(cfg.max_message_size);
        Ok(Connector {
            client,
            cluster: Arc::new(cfg.cluster.clone()),
            target: target.clone(),
            ws_config,
        })
    }

    pub fn target(&self) -> &PodRef {
        &self.target
    }

    /// Upgrades a connection to the pod's port-forward endpoint for `ports`. Every
    /// failure is reported as `UpgradeFailed`.
    pub async fn connect(&self, ports: &[u16]) -> Result<WsStream, Error> {
        let failed = |status: Option<StatusCode>, reason: String| Error::UpgradeFailed {
            target: self.target.clone(),
            status,
            reason,
        };

        let path = session_path(&self.target, ports);
        let mut req = hyper_util::api_request(&self.cluster, Method::GET, &path)
            .map_err(|e| failed(None, e.to_string()))?;
        let key = generate_key();
        let headers = req.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(CHANNEL_PROTOCOL));
        headers.insert(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_str(&key).map_err(|e| failed(None, e.to_string()))?,
        );

        let res = hyper_util::send(&self.client, &self.cluster, req)
            .await
            .map_err(|e| failed(None, e.to_string()))?;
        let status = res.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let body = hyper_util::read_error_body(&self.cluster, res.into_body()).await;
            let mut reason = hyper_util::status_message(&body);
            if reason.is_empty() {
                reason = status
                    .canonical_reason()
                    .unwrap_or("unexpected response")
                    .to_string();
            }
            return Err(failed(Some(status), reason));
        }

        let accept = derive_accept_key(key.as_bytes());
        if res.headers().get(SEC_WEBSOCKET_ACCEPT).map(HeaderValue::as_bytes) != Some(accept.as_bytes()) {
            return Err(failed(Some(status), "invalid Sec-WebSocket-Accept".to_string()));
        }
        // Servers that predate subprotocol negotiation answer without the header.
        if let Some(protocol) = res.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            if protocol != CHANNEL_PROTOCOL {
                return Err(failed(
                    Some(status),
                    format!("server selected unsupported protocol {protocol:?}"),
                ));
            }
        }

        let upgraded = hyper::upgrade::on(res)
            .await
            .map_err(|e| failed(Some(status), format!("upgrade failed: {e}")))?;
        debug!(pod = %self.target, ?ports, "port-forward session established");
        Ok(WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            Role::Client,
            Some(self.ws_config),
        )
        .await)
    }
}

fn session_path(target: &PodRef, ports: &[u16]) -> String {
    let query = ports
        .iter()
        .map(|p| format!("{PORTS_PARAM}={p}"))
        .join("&");
    format!("{}?{query}", target.portforward_path())
}
