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

use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::config::{ClusterConfig, Config};

pub mod apiserver;
pub mod echo;
pub mod helpers;

/// Configuration pointing at a plaintext API server on `server`, with short timeouts.
pub fn test_config(server: SocketAddr) -> Config {
    let mut cluster = ClusterConfig::new(format!("http://{server}"));
    cluster.connect_timeout = Duration::from_secs(5);
    let mut cfg = Config::new(cluster);
    cfg.ready_timeout = Duration::from_secs(5);
    cfg
}

pub async fn assert_eventually<F, T, Fut>(dur: Duration, f: F, expected: T)
where
    F: Fn() -> Fut,
    Fut: Future<Output = T>,
    T: Eq + Debug,
{
    let mut delay = Duration::from_millis(10);
    let end = Instant::now() + dur;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let last = f().await;
        if last == expected {
            return;
        }
        trace!("attempt {attempts} with delay {delay:?}");
        if Instant::now() + delay > end {
            panic!("assert_eventually failed after {attempts}: last response: {last:?}")
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
