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

//! Port forwarding to a pod through the API server.
//!
//! Sessions are websocket upgrades of
//! `GET /api/v1/namespaces/{ns}/pods/{pod}/portforward?ports=...` speaking the
//! `v4.channel.k8s.io` channel protocol. A tunnel keeps one control session open for
//! all of its ports: it decides readiness and carries the keepalive. Every accepted
//! local connection then gets a session of its own for its port, whose data channel
//! carries the connection's bytes and whose error channel says why the pod could not
//! be reached.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use http::StatusCode;
use itertools::Itertools;

use crate::resolve::PodRef;

pub mod channel;
mod forwarder;
pub(crate) mod session;
mod tunnel;

pub use tunnel::{Readiness, Tunnel, establish};

/// Websocket subprotocol negotiated with the API server.
pub const CHANNEL_PROTOCOL: &str = "v4.channel.k8s.io";
/// Query parameter naming each pod port of a session.
pub const PORTS_PARAM: &str = "ports";
/// Each port takes two channels and a channel is one byte.
pub const MAX_PORTS: usize = 128;

/// A requested forward. `local: None` lets the OS pick an ephemeral port.
///
/// Parses from `REMOTE`, `:REMOTE` or `LOCAL:REMOTE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub local: Option<u16>,
    pub remote: u16,
}

impl PortSpec {
    /// Forwards `remote` from an ephemeral local port.
    pub fn remote(remote: u16) -> Self {
        PortSpec {
            local: None,
            remote,
        }
    }

    /// Forwards `remote` from a fixed local port.
    pub fn pinned(local: u16, remote: u16) -> Self {
        PortSpec {
            local: Some(local),
            remote,
        }
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidPorts(format!("cannot parse {s:?}"));
        let (local, remote) = match s.split_once(':') {
            Some((local, remote)) => (Some(local), remote),
            None => (None, s),
        };
        let remote = remote.parse::<u16>().map_err(|_| invalid())?;
        let local = match local {
            None | Some("") => None,
            Some(l) => Some(l.parse::<u16>().map_err(|_| invalid())?),
        };
        Ok(PortSpec {
            local: local.filter(|p| *p != 0),
            remote,
        })
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "{local}:{}", self.remote),
            None => write!(f, ":{}", self.remote),
        }
    }
}

/// A bound local listener and the pod port it forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PortBinding {
    pub local: SocketAddr,
    pub remote: u16,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

pub fn validate_ports(ports: &[PortSpec]) -> Result<(), Error> {
    if ports.is_empty() {
        return Err(Error::InvalidPorts(
            "at least one port is required".to_string(),
        ));
    }
    if ports.iter().any(|p| p.remote == 0) {
        return Err(Error::InvalidPorts(
            "remote port 0 is not allowed".to_string(),
        ));
    }
    if ports.len() > MAX_PORTS {
        return Err(Error::InvalidPorts(format!(
            "at most {MAX_PORTS} ports can be forwarded at once"
        )));
    }
    if let Some(dup) = ports.iter().map(|p| p.remote).duplicates().next() {
        return Err(Error::InvalidPorts(format!(
            "remote port {dup} requested more than once"
        )));
    }
    if let Some(dup) = ports.iter().filter_map(|p| p.local).duplicates().next() {
        return Err(Error::InvalidPorts(format!(
            "local port {dup} requested more than once"
        )));
    }
    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid port request: {0}")]
    InvalidPorts(String),

    #[error("failed to open port-forward session to pod {target}{}: {reason}", display_status(.status))]
    UpgradeFailed {
        target: PodRef,
        status: Option<StatusCode>,
        reason: String,
    },

    #[error("failed to listen on {addr} for remote port {remote}: {source}")]
    BindFailed {
        addr: SocketAddr,
        remote: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel to pod {target} not ready after {timeout:?}")]
    ReadyTimeout { target: PodRef, timeout: Duration },

    #[error("tunnel to pod {target} failed before becoming ready: {reason}")]
    Establish { target: PodRef, reason: String },

    #[error("tunnel to pod {target} lost: {reason}")]
    ForwardingFault { target: PodRef, reason: String },
}

fn display_status(status: &Option<StatusCode>) -> String {
    match status {
        Some(s) => format!(" (status {s})"),
        None => String::new(),
    }
}

/// Events reported by the forwarder to the diagnostics task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Diagnostic {
    Listening(PortBinding),
    Ready,
    /// Text the remote side wrote on a connection's error channel.
    StreamError {
        remote: u16,
        connection: u64,
        message: String,
    },
    /// The session is unusable.
    Fault(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("8080", PortSpec::remote(8080); "remote only")]
    #[test_case(":16686", PortSpec::remote(16686); "ephemeral local")]
    #[test_case("9000:8080", PortSpec::pinned(9000, 8080); "pinned local")]
    #[test_case("0:8080", PortSpec::remote(8080); "zero local is ephemeral")]
    fn parse_port_spec(input: &str, expected: PortSpec) {
        assert_eq!(input.parse::<PortSpec>().unwrap(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("http"; "name")]
    #[test_case("70000"; "out of range")]
    #[test_case("a:80"; "bad local")]
    #[test_case("80:"; "missing remote")]
    fn parse_port_spec_rejects(input: &str) {
        assert!(matches!(
            input.parse::<PortSpec>(),
            Err(Error::InvalidPorts(_))
        ));
    }

    #[test]
    fn port_spec_display_round_trips() {
        for spec in [PortSpec::remote(80), PortSpec::pinned(8080, 80)] {
            assert_eq!(spec.to_string().parse::<PortSpec>().unwrap(), spec);
        }
    }

    #[test]
    fn validate() {
        validate_ports(&[PortSpec::remote(80), PortSpec::remote(443)]).unwrap();
        validate_ports(&(1..=MAX_PORTS as u16).map(PortSpec::remote).collect::<Vec<_>>()).unwrap();
        validate_ports(&[PortSpec::pinned(8080, 80), PortSpec::remote(443)]).unwrap();

        let invalid = [
            vec![],
            vec![PortSpec::remote(0)],
            vec![PortSpec::remote(80), PortSpec::pinned(8080, 80)],
            vec![PortSpec::pinned(8080, 80), PortSpec::pinned(8080, 81)],
            (1..=MAX_PORTS as u16 + 1).map(PortSpec::remote).collect(),
        ];
        for ports in invalid {
            assert!(
                matches!(validate_ports(&ports), Err(Error::InvalidPorts(_))),
                "{ports:?}"
            );
        }
    }

    #[test]
    fn error_messages_name_target() {
        let target = PodRef::new("default", "jaeger-0");
        let err = Error::UpgradeFailed {
            target: target.clone(),
            status: Some(StatusCode::NOT_FOUND),
            reason: r#"pods "jaeger-0" not found"#.to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"failed to open port-forward session to pod default/jaeger-0 (status 404 Not Found): pods "jaeger-0" not found"#
        );
        let err = Error::ReadyTimeout {
            target,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            err.to_string(),
            "tunnel to pod default/jaeger-0 not ready after 1s"
        );
    }
}
