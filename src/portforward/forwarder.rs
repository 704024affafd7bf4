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

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::channel::{ChannelError, ChannelStream, Prefixes, split_frame};
use super::session::{Connector, SessionIo, WsStream};
use super::{Diagnostic, Error, PortBinding, PortSpec};
use crate::copy;
use crate::drain::DrainWatcher;

// Shortest pause before reopening a control session that ended.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Binds one listener per requested port. On failure every listener bound so far is
/// closed before returning.
pub(super) async fn bind(
    addr: IpAddr,
    ports: &[PortSpec],
) -> Result<Vec<(TcpListener, PortBinding)>, Error> {
    let mut bound = Vec::with_capacity(ports.len());
    for spec in ports {
        let requested = SocketAddr::new(addr, spec.local.unwrap_or(0));
        let bind_failed = |source| Error::BindFailed {
            addr: requested,
            remote: spec.remote,
            source,
        };
        let listener = TcpListener::bind(requested).await.map_err(bind_failed)?;
        let local = listener.local_addr().map_err(bind_failed)?;
        bound.push((
            listener,
            PortBinding {
                local,
                remote: spec.remote,
            },
        ));
    }
    Ok(bound)
}

/// Owns the control session and the listeners for the life of a tunnel.
pub(super) struct Forwarder {
    pub connector: Connector,
    pub control: WsStream,
    pub listeners: Vec<(TcpListener, PortBinding)>,
    pub diagnostics: mpsc::UnboundedSender<Diagnostic>,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Forwarder {
    /// Runs until the tunnel faults or `drain` is signaled. Returning drops the
    /// listeners, the control session and every in-flight connection.
    pub async fn run(self, drain: DrainWatcher) {
        let Forwarder {
            connector,
            control,
            listeners,
            diagnostics,
            keepalive_interval,
            keepalive_timeout,
        } = self;
        let ports: Vec<u16> = listeners.iter().map(|(_, b)| b.remote).collect();

        let serve = async move {
            let mut control = Control::new(control, &ports);
            if let Err(reason) = control.opened().await {
                let _ = diagnostics.send(Diagnostic::Fault(reason));
                return;
            }
            for (_, binding) in &listeners {
                let _ = diagnostics.send(Diagnostic::Listening(*binding));
            }
            let _ = diagnostics.send(Diagnostic::Ready);

            let mut incoming = futures::stream::select_all(listeners.into_iter().map(
                |(listener, binding)| {
                    TcpListenerStream::new(listener).map(move |accepted| (accepted, binding))
                },
            ));
            let supervisor = supervise(
                control,
                connector.clone(),
                ports,
                keepalive_interval,
                keepalive_timeout,
            );
            tokio::pin!(supervisor);
            let mut connections = JoinSet::new();
            let mut next_connection = 0u64;
            loop {
                tokio::select! {
                    Some((accepted, binding)) = incoming.next() => match accepted {
                        Ok(stream) => {
                            let _ = stream.set_nodelay(true);
                            let id = next_connection;
                            next_connection = next_connection.wrapping_add(1);
                            let span = info_span!("connection", id, remote = binding.remote, peer = ?stream.peer_addr().ok());
                            connections.spawn(
                                forward_connection(connector.clone(), stream, binding, id, diagnostics.clone())
                                    .instrument(span),
                            );
                        }
                        Err(e) => warn!(local = %binding.local, "failed to accept connection: {e}"),
                    },
                    Some(finished) = connections.join_next() => {
                        if let Err(e) = finished {
                            if e.is_panic() {
                                error!("connection task panicked: {e}");
                            }
                        }
                    }
                    reason = &mut supervisor => {
                        let _ = diagnostics.send(Diagnostic::Fault(reason));
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = serve => {}
            _ = drain.signaled() => {
                debug!("stopping forwarder");
            }
        }
    }
}

/// Keeps a control session open for the life of the tunnel. A session that ends is
/// reopened; the returned reason explains why that was not possible.
async fn supervise(
    mut control: Control<SessionIo>,
    connector: Connector,
    ports: Vec<u16>,
    keepalive_interval: Duration,
    keepalive_timeout: Duration,
) -> String {
    let max_delay = keepalive_interval.max(RECONNECT_DELAY);
    let mut delay = RECONNECT_DELAY;
    loop {
        let opened_at = Instant::now();
        let reason = control.watch(keepalive_interval, keepalive_timeout).await;
        let lived = opened_at.elapsed();
        debug!("control session ended: {reason}");
        // Sessions that end right away are retried ever more slowly.
        if lived < delay {
            tokio::time::sleep(delay - lived).await;
            delay = (delay * 2).min(max_delay);
        } else {
            delay = RECONNECT_DELAY;
        }

        let reopened = async {
            let ws = connector.connect(&ports).await.map_err(|e| e.to_string())?;
            let mut control = Control::new(ws, &ports);
            tokio::time::timeout(keepalive_timeout, control.opened())
                .await
                .map_err(|_| format!("ports not opened within {keepalive_timeout:?}"))??;
            Ok::<_, String>(control)
        };
        control = match reopened.await {
            Ok(control) => control,
            Err(e) => return format!("{reason}; reopening failed: {e}"),
        };
        info!(pod = %connector.target(), "control session reopened");
    }
}

/// A session requesting every port of the tunnel, used to decide readiness and to
/// notice a lost pod or API server. Its data is discarded.
struct Control<IO> {
    ws: WebSocketStream<IO>,
    prefixes: Prefixes,
}

impl<IO> Control<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn new(ws: WebSocketStream<IO>, ports: &[u16]) -> Self {
        Control {
            ws,
            prefixes: Prefixes::new(ports),
        }
    }

    /// Waits until the server has opened every channel.
    async fn opened(&mut self) -> Result<(), String> {
        while !self.prefixes.complete() {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let (channel, payload) =
                        split_frame(&data).ok_or_else(|| ChannelError::Empty.to_string())?;
                    let rest = self
                        .prefixes
                        .accept(channel, payload)
                        .map_err(|e| e.to_string())?;
                    if channel % 2 == 1 && !rest.is_empty() {
                        return Err(String::from_utf8_lossy(rest).into_owned());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err("session closed before every port was opened".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(format!("session lost: {e}")),
            }
        }
        Ok(())
    }

    /// Reads the session and pings it every `interval`. Returns once the session ends
    /// or a ping goes unanswered for `timeout`.
    async fn watch(&mut self, interval: Duration, timeout: Duration) -> String {
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut pong_deadline: Option<Instant> = None;
        loop {
            let deadline = pong_deadline;
            let expired = async move {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                message = self.ws.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some((channel, text)) = split_frame(&data) {
                            if channel % 2 == 1 && !text.is_empty() {
                                debug!(channel, "control session error: {}", String::from_utf8_lossy(text));
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) if !frame.reason.is_empty() => {
                                format!("session closed by remote: {}", frame.reason)
                            }
                            _ => "session closed by remote".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    None => return "session closed by remote".to_string(),
                    Some(Err(e)) => return format!("session lost: {e}"),
                },
                _ = keepalive.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = self.ws.send(Message::Ping(Vec::new())).await {
                            return format!("sending keepalive: {e}");
                        }
                        pong_deadline = Some(Instant::now() + timeout);
                    }
                }
                _ = expired => return format!("keepalive not answered within {timeout:?}"),
            }
        }
    }
}

async fn forward_connection(
    connector: Connector,
    local: TcpStream,
    binding: PortBinding,
    id: u64,
    diagnostics: mpsc::UnboundedSender<Diagnostic>,
) {
    let ws = match connector.connect(&[binding.remote]).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("failed to open session: {e}");
            let _ = diagnostics.send(Diagnostic::StreamError {
                remote: binding.remote,
                connection: id,
                message: e.to_string(),
            });
            return;
        }
    };
    debug!("forwarding connection");

    let mut remote = ChannelStream::new(ws, binding.remote);
    let copied = copy::copy_bidirectional(local, &mut remote).await;
    if !remote.remote_error().is_empty() {
        let _ = diagnostics.send(Diagnostic::StreamError {
            remote: binding.remote,
            connection: id,
            message: remote.remote_error().to_string(),
        });
    }
    match copied {
        Ok(transferred) => debug!(
            sent = transferred.sent,
            received = transferred.received,
            "connection closed"
        ),
        Err(e) => debug!("connection closed with error: {e}"),
    }
}
