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

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::forwarder::{self, Forwarder};
use super::session::Connector;
use super::{Diagnostic, Error, PortBinding, PortSpec, validate_ports};
use crate::config::Config;
use crate::drain::{self, DrainHandle, DrainTrigger, DrainWatcher};
use crate::resolve::PodRef;

/// Readiness of a tunnel. Leaves `Pending` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    /// The forwarder reported a problem before it was ready.
    Failed(String),
}

/// Opens a tunnel and waits up to `ready_timeout` for it to become ready. A tunnel that
/// does not become ready is torn down before the error is returned.
pub async fn establish(
    cfg: &Config,
    target: &PodRef,
    ports: &[PortSpec],
    ready_timeout: Duration,
) -> Result<Tunnel, Error> {
    let mut tunnel = Tunnel::start(cfg, target, ports).await?;
    if let Err(e) = tunnel.wait_ready(ready_timeout).await {
        tunnel.teardown().await;
        return Err(e);
    }
    Ok(tunnel)
}

/// A port-forward tunnel to one pod.
///
/// Local listeners stay bound and the session stays open until `teardown` is called,
/// the tunnel is dropped, or the session is lost. A stopped tunnel cannot be restarted.
#[derive(Debug)]
pub struct Tunnel {
    target: PodRef,
    bindings: Vec<PortBinding>,
    drain: DrainTrigger,
    ready: watch::Receiver<Readiness>,
    fault: watch::Receiver<Option<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Tunnel {
    /// Opens the control session, binds the listeners and starts the background tasks.
    /// The returned tunnel is not necessarily ready yet; see [`Tunnel::wait_ready`].
    pub async fn start(cfg: &Config, target: &PodRef, ports: &[PortSpec]) -> Result<Tunnel, Error> {
        validate_ports(ports)?;
        let connector = Connector::new(cfg, target).await?;
        let remotes: Vec<u16> = ports.iter().map(|p| p.remote).collect();
        // The upgrade completes before any local port is opened.
        let control = connector.connect(&remotes).await?;
        // On failure the session is dropped here, closing the upgraded connection.
        let listeners = forwarder::bind(cfg.listen_address, ports).await?;
        let bindings: Vec<PortBinding> = listeners.iter().map(|(_, b)| *b).collect();

        let (drain_tx, drain_rx) = drain::new();
        let (diag_tx, diag_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let (fault_tx, fault_rx) = watch::channel(None);

        let span = info_span!("tunnel", pod = %target);
        let forwarder = Forwarder {
            connector,
            control,
            listeners,
            diagnostics: diag_tx,
            keepalive_interval: cfg.keepalive_interval,
            keepalive_timeout: cfg.keepalive_timeout,
        };
        let forward_task = tokio::spawn(forwarder.run(drain_rx.clone()).instrument(span.clone()));
        let diagnostics_task = tokio::spawn(
            watch_diagnostics(diag_rx, ready_tx, fault_tx, drain_rx).instrument(span),
        );
        debug!(pod = %target, ?bindings, "tunnel started");

        Ok(Tunnel {
            target: target.clone(),
            bindings,
            drain: drain_tx,
            ready: ready_rx,
            fault: fault_rx,
            tasks: vec![forward_task, diagnostics_task],
        })
    }

    /// Waits until the tunnel is ready, it fails, or `timeout` elapses. Does not tear
    /// the tunnel down on error.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        let mut ready = self.ready.clone();
        let waited =
            tokio::time::timeout(timeout, ready.wait_for(|r| *r != Readiness::Pending)).await;
        let state = match waited {
            Err(_) => {
                return Err(Error::ReadyTimeout {
                    target: self.target.clone(),
                    timeout,
                });
            }
            // The diagnostics task is gone without deciding.
            Ok(Err(_)) => Readiness::Pending,
            Ok(Ok(state)) => (*state).clone(),
        };
        let reason = match state {
            Readiness::Ready => return Ok(()),
            Readiness::Failed(reason) => reason,
            Readiness::Pending => "tunnel stopped before becoming ready".to_string(),
        };
        Err(Error::Establish {
            target: self.target.clone(),
            reason,
        })
    }

    pub fn readiness(&self) -> Readiness {
        self.ready.borrow().clone()
    }

    pub fn target(&self) -> &PodRef {
        &self.target
    }

    /// One entry per requested port, in request order.
    pub fn bindings(&self) -> &[PortBinding] {
        &self.bindings
    }

    /// The local address forwarding to `remote`, if it was requested.
    pub fn local_addr(&self, remote: u16) -> Option<SocketAddr> {
        self.bindings
            .iter()
            .find(|b| b.remote == remote)
            .map(|b| b.local)
    }

    /// A handle that stops the tunnel from elsewhere. It does not wait for the stop to
    /// finish; `teardown` does.
    pub fn stop_handle(&self) -> DrainHandle {
        self.drain.handle()
    }

    /// The fault that ended the tunnel after it became ready, if any.
    pub fn fault(&self) -> Option<Error> {
        self.fault.borrow().clone().map(|reason| self.fault_error(reason))
    }

    /// Waits for a fault. Returns `None` if the tunnel stops without one.
    pub async fn faulted(&self) -> Option<Error> {
        let mut fault = self.fault.clone();
        // A closed channel means the tunnel stopped; the last value still tells why.
        let _ = fault.wait_for(Option::is_some).await;
        let reason = fault.borrow().clone();
        reason.map(|reason| self.fault_error(reason))
    }

    pub fn is_stopped(&self) -> bool {
        self.drain.is_draining() || self.tasks.iter().all(|t| t.is_finished())
    }

    /// Stops forwarding and waits until every listener and the session are released.
    /// Safe to call more than once, and before the tunnel is ready.
    pub async fn teardown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        self.drain.start_drain_and_wait().await;
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(pod = %self.target, "tunnel task panicked: {e}");
                }
            }
        }
        info!(pod = %self.target, "tunnel closed");
    }

    fn fault_error(&self, reason: String) -> Error {
        Error::ForwardingFault {
            target: self.target.clone(),
            reason,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.drain.start_drain();
    }
}

/// Turns forwarder diagnostics into readiness and fault state. Ends when the forwarder
/// is gone or the tunnel is stopped.
async fn watch_diagnostics(
    mut diagnostics: mpsc::UnboundedReceiver<Diagnostic>,
    ready: watch::Sender<Readiness>,
    fault: watch::Sender<Option<String>>,
    drain: DrainWatcher,
) {
    loop {
        let diagnostic = tokio::select! {
            d = diagnostics.recv() => match d {
                Some(d) => d,
                None => return,
            },
            _ = drain.signaled() => return,
        };
        let state = ready.borrow().clone();
        match (diagnostic, state) {
            (Diagnostic::Listening(binding), _) => {
                info!(local = %binding.local, remote = binding.remote, "forwarding from {binding}");
            }
            (Diagnostic::Ready, Readiness::Pending) => {
                ready.send_replace(Readiness::Ready);
                info!("tunnel ready");
            }
            (Diagnostic::Ready, _) => {}
            (Diagnostic::StreamError { message, .. }, Readiness::Pending)
            | (Diagnostic::Fault(message), Readiness::Pending) => {
                warn!("tunnel failed before becoming ready: {message}");
                ready.send_replace(Readiness::Failed(message));
            }
            (
                Diagnostic::StreamError {
                    remote,
                    connection,
                    message,
                },
                _,
            ) => {
                warn!(remote, connection, "error forwarding connection: {message}");
            }
            (Diagnostic::Fault(reason), Readiness::Ready) => {
                warn!("tunnel lost: {reason}");
                fault.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(reason);
                        true
                    } else {
                        false
                    }
                });
            }
            (Diagnostic::Fault(reason), Readiness::Failed(_)) => {
                debug!("ignoring fault after failure: {reason}");
            }
        }
    }
}
