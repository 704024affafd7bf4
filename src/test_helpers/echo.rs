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
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::trace;

/// Echoes back whatever each connection sends, optionally after a fixed greeting.
pub struct TestServer {
    listener: TcpListener,
    greeting: Option<Vec<u8>>,
}

impl TestServer {
    pub async fn new() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        TestServer {
            listener,
            greeting: None,
        }
    }

    /// Sent on every accepted connection before echoing. Lets a test tell servers apart.
    pub fn with_greeting(mut self, greeting: &[u8]) -> Self {
        self.greeting = Some(greeting.to_vec());
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Starts serving in the background and returns the address.
    pub fn spawn(self) -> SocketAddr {
        let address = self.address();
        tokio::spawn(self.run());
        address
    }

    pub async fn run(self) {
        loop {
            let Ok((mut socket, _)) = self.listener.accept().await else {
                return;
            };
            let greeting = self.greeting.clone();
            tokio::spawn(async move {
                if let Some(greeting) = greeting {
                    if socket.write_all(&greeting).await.is_err() {
                        return;
                    }
                }
                let mut buf = vec![0; 64 * 1024];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    trace!("echo received {n}");
                    if socket.write_all(&buf[0..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    }
}
