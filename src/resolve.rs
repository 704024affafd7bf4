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

use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::hyper_util;

/// Identifies a pod by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        PodRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn portforward_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/pods/{}/portforward",
            self.namespace, self.name
        )
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no pod in namespace {namespace} named {prefix}* running image {image}")]
    NotFound {
        namespace: String,
        prefix: String,
        image: String,
    },
    #[error("{} pods in namespace {namespace} match {prefix}* with image {image}: {}", .candidates.len(), .candidates.join(", "))]
    Ambiguous {
        namespace: String,
        prefix: String,
        image: String,
        candidates: Vec<String>,
    },
    #[error("listing pods failed (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("listing pods failed: {0}")]
    Connect(#[from] hyper_util::Error),
    #[error("decoding pod list: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Finds the pod a tunnel should target.
#[async_trait::async_trait]
pub trait PodResolver: Send + Sync {
    async fn resolve(&self, namespace: &str, prefix: &str, image: &str) -> Result<PodRef, Error>;
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct PodList {
    pub items: Vec<Pod>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct ObjectMeta {
    pub name: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Container {
    pub image: String,
}

/// Picks the single pod whose name starts with `prefix` and which runs a container
/// whose image contains `image`.
pub fn select_pod(namespace: &str, pods: &[Pod], prefix: &str, image: &str) -> Result<PodRef, Error> {
    let mut candidates: Vec<&str> = pods
        .iter()
        .filter(|p| p.metadata.name.starts_with(prefix))
        .filter(|p| p.spec.containers.iter().any(|c| c.image.contains(image)))
        .map(|p| p.metadata.name.as_str())
        .collect();
    match candidates.len() {
        0 => Err(Error::NotFound {
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            image: image.to_string(),
        }),
        1 => Ok(PodRef::new(namespace, candidates[0])),
        _ => {
            candidates.sort_unstable();
            Err(Error::Ambiguous {
                namespace: namespace.to_string(),
                prefix: prefix.to_string(),
                image: image.to_string(),
                candidates: candidates.into_iter().map(str::to_string).collect(),
            })
        }
    }
}

/// Resolves pods by listing them from the API server.
pub struct ApiResolver {
    cluster: ClusterConfig,
}

impl ApiResolver {
    pub fn new(cluster: ClusterConfig) -> Self {
        ApiResolver { cluster }
    }

    pub async fn list(&self, namespace: &str) -> Result<PodList, Error> {
        let client = hyper_util::api_client(&self.cluster).await?;
        let path = format!("/api/v1/namespaces/{namespace}/pods");
        let req = hyper_util::api_request(&self.cluster, Method::GET, &path)?;
        let res = hyper_util::send(&client, &self.cluster, req).await?;
        let status = res.status();
        if status != StatusCode::OK {
            let body = hyper_util::read_error_body(&self.cluster, res.into_body()).await;
            return Err(Error::Api {
                status,
                message: hyper_util::status_message(&body),
            });
        }
        let body = hyper_util::read_body(&self.cluster, res.into_body()).await?;
        let pods: PodList = serde_json::from_slice(&body)?;
        debug!(namespace, pods = pods.items.len(), "listed pods");
        Ok(pods)
    }
}

#[async_trait::async_trait]
impl PodResolver for ApiResolver {
    async fn resolve(&self, namespace: &str, prefix: &str, image: &str) -> Result<PodRef, Error> {
        let pods = self.list(namespace).await?;
        select_pod(namespace, &pods.items, prefix, image)
    }
}
