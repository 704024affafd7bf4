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

use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;

const KUBE_API_SERVER: &str = "KUBE_API_SERVER";
const KUBE_TOKEN: &str = "KUBE_TOKEN";
const KUBE_TOKEN_FILE: &str = "KUBE_TOKEN_FILE";
const KUBE_CA_FILE: &str = "KUBE_CA_FILE";
const KUBE_INSECURE_SKIP_TLS_VERIFY: &str = "KUBE_INSECURE_SKIP_TLS_VERIFY";
const TUNNEL_CONFIG: &str = "TUNNEL_CONFIG";
const LISTEN_ADDRESS: &str = "LISTEN_ADDRESS";
const READY_TIMEOUT: &str = "READY_TIMEOUT";
const CONNECT_TIMEOUT: &str = "CONNECT_TIMEOUT";
const KEEPALIVE_INTERVAL: &str = "KEEPALIVE_INTERVAL";
const KEEPALIVE_TIMEOUT: &str = "KEEPALIVE_TIMEOUT";

const DEFAULT_API_SERVER: &str = "https://localhost:6443";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
// Largest websocket message accepted from the API server.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum RootCert {
    File(PathBuf),
    Static(Bytes),
    Default,
}

/// Bearer credential presented to the API server. Supplied already valid; never refreshed here.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    None,
    Token(String),
    /// Re-read on every request so rotated projected tokens are picked up.
    TokenFile(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => write!(f, "None"),
            Credential::Token(_) => write!(f, "Token(<redacted>)"),
            Credential::TokenFile(p) => f.debug_tuple("TokenFile").field(p).finish(),
        }
    }
}

/// How to reach and authenticate to the cluster API server.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Base URL, `https://` or `http://`, optionally with a path prefix.
    pub server: String,
    #[serde(skip_serializing)]
    pub credential: Credential,
    pub root_cert: RootCert,
    pub insecure_skip_tls_verify: bool,
    /// Bounds TCP connect and the whole upgrade/API request.
    pub connect_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(server: impl Into<String>) -> Self {
        ClusterConfig {
            server: server.into(),
            credential: Credential::None,
            root_cert: RootCert::Default,
            insecure_skip_tls_verify: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn bearer_token(&self) -> Result<Option<String>, Error> {
        match &self.credential {
            Credential::None => Ok(None),
            Credential::Token(t) => Ok(Some(t.clone())),
            Credential::TokenFile(path) => fs::read_to_string(path)
                .map(|t| Some(t.trim().to_string()))
                .map_err(|e| Error::Token(path.clone(), e)),
        }
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub cluster: ClusterConfig,
    /// Local IP every forwarded port listens on.
    pub listen_address: IpAddr,
    /// Default readiness deadline used by the CLI.
    pub ready_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,

    pub max_message_size: usize,
}

impl Config {
    pub fn new(cluster: ClusterConfig) -> Self {
        Config {
            cluster,
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("error parsing tunnel config: {0}")]
    TunnelConfig(anyhow::Error),
    #[error("failed to read bearer token from {0}: {1}")]
    Token(PathBuf, std::io::Error),
}

/// Settings read from the optional YAML file named by `TUNNEL_CONFIG`.
#[derive(Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    /// Base64 encoded PEM bundle, as found in kubeconfig `certificate-authority-data`.
    pub ca_data: Option<String>,
    pub insecure_skip_tls_verify: Option<bool>,
    pub listen_address: Option<IpAddr>,
    pub ready_timeout: Option<String>,
    pub connect_timeout: Option<String>,
    pub keepalive_interval: Option<String>,
    pub keepalive_timeout: Option<String>,
}

/// Duration accepting `30s`, `500ms`, `1m30s` and the like.
struct EnvDuration(Duration);

impl FromStr for EnvDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(EnvDuration)
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_duration(env: &str) -> Result<Option<Duration>, Error> {
    parse::<EnvDuration>(env).map(|d| d.map(|d| d.0))
}

fn file_duration(field: &str, value: Option<&String>) -> Result<Option<Duration>, Error> {
    value
        .map(|v| {
            duration_str::parse(v)
                .map_err(|e| Error::TunnelConfig(anyhow!("invalid {field} {v:?}: {e}")))
        })
        .transpose()
}

pub fn parse_config() -> Result<Config, Error> {
    let path = empty_to_none(parse::<String>(TUNNEL_CONFIG)?);
    let file = match path {
        Some(path) => construct_file_config(&path).map_err(Error::TunnelConfig)?,
        None => FileConfig::default(),
    };
    construct_config(file)
}

fn construct_file_config(path: &str) -> anyhow::Result<FileConfig> {
    let f = fs::File::open(path).map_err(|e| anyhow!("failed opening {path}: {e}"))?;
    serde_yaml::from_reader(f).map_err(|e| anyhow!("failed parsing {path}: {e}"))
}

/// Builds the configuration from file settings, letting environment variables override them.
pub fn construct_config(file: FileConfig) -> Result<Config, Error> {
    let server = empty_to_none(parse::<String>(KUBE_API_SERVER)?)
        .or(file.server.clone())
        .unwrap_or_else(|| DEFAULT_API_SERVER.to_string());

    let credential = if let Some(token) = empty_to_none(parse::<String>(KUBE_TOKEN)?) {
        Credential::Token(token)
    } else if let Some(path) = empty_to_none(parse::<String>(KUBE_TOKEN_FILE)?) {
        Credential::TokenFile(PathBuf::from(path))
    } else if let Some(token) = empty_to_none(file.token.clone()) {
        Credential::Token(token)
    } else if let Some(path) = file.token_file.clone() {
        Credential::TokenFile(path)
    } else {
        Credential::None
    };

    let root_cert = if let Some(path) = empty_to_none(parse::<String>(KUBE_CA_FILE)?) {
        RootCert::File(PathBuf::from(path))
    } else if let Some(path) = file.ca_file.clone() {
        RootCert::File(path)
    } else if let Some(data) = empty_to_none(file.ca_data.clone()) {
        let pem = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::TunnelConfig(anyhow!("invalid caData: {e}")))?;
        RootCert::Static(Bytes::from(pem))
    } else {
        RootCert::Default
    };

    let mut cluster = ClusterConfig::new(server);
    cluster.credential = credential;
    cluster.root_cert = root_cert;
    cluster.insecure_skip_tls_verify = parse(KUBE_INSECURE_SKIP_TLS_VERIFY)?
        .or(file.insecure_skip_tls_verify)
        .unwrap_or(false);
    cluster.connect_timeout = parse_duration(CONNECT_TIMEOUT)?
        .or(file_duration("connectTimeout", file.connect_timeout.as_ref())?)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut cfg = Config::new(cluster);
    cfg.listen_address = parse(LISTEN_ADDRESS)?
        .or(file.listen_address)
        .unwrap_or(cfg.listen_address);
    cfg.ready_timeout = parse_duration(READY_TIMEOUT)?
        .or(file_duration("readyTimeout", file.ready_timeout.as_ref())?)
        .unwrap_or(DEFAULT_READY_TIMEOUT);
    cfg.keepalive_interval = parse_duration(KEEPALIVE_INTERVAL)?
        .or(file_duration("keepaliveInterval", file.keepalive_interval.as_ref())?)
        .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL);
    cfg.keepalive_timeout = parse_duration(KEEPALIVE_TIMEOUT)?
        .or(file_duration("keepaliveTimeout", file.keepalive_timeout.as_ref())?)
        .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT);
    Ok(cfg)
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}
