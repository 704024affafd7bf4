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

//! One-shot stop signal shared between a tunnel and its background tasks.

pub use internal::Handle as DrainHandle;
pub use internal::Signal as DrainTrigger;
pub use internal::Watch as DrainWatcher;

/// New constructs a new pair for stopping background work.
/// * DrainTrigger starts the stop and can wait for every watcher to go away.
/// * DrainWatcher is held by each task taking part. It can be cloned, and a
///   stop does not complete until all outstanding DrainWatchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    internal::channel()
}

mod internal {
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    pub fn channel() -> (Signal, Watch) {
        let (signal_tx, signal_rx) = watch::channel(false);
        let (drained_tx, drained_rx) = mpsc::channel(1);

        let signal = Signal {
            drained_rx,
            signal_tx: Arc::new(signal_tx),
        };
        let watch = Watch {
            drained_tx,
            signal_rx,
        };
        (signal, watch)
    }

    enum Never {}

    /// Owner side of the stop signal.
    pub struct Signal {
        drained_rx: mpsc::Receiver<Never>,
        signal_tx: Arc<watch::Sender<bool>>,
    }

    /// Cloneable trigger that can start a stop but not wait for it.
    #[derive(Clone)]
    pub struct Handle(Arc<watch::Sender<bool>>);

    /// Watch for a stop command.
    ///
    /// All `Watch` instances must be dropped for `Signal::start_drain_and_wait` to
    /// complete.
    #[derive(Clone)]
    pub struct Watch {
        drained_tx: mpsc::Sender<Never>,
        signal_rx: watch::Receiver<bool>,
    }

    impl Signal {
        pub fn handle(&self) -> Handle {
            Handle(self.signal_tx.clone())
        }

        /// Signals every watcher. Calling this more than once has no further effect.
        pub fn start_drain(&self) {
            self.signal_tx.send_replace(true);
        }

        pub fn is_draining(&self) -> bool {
            *self.signal_tx.borrow()
        }

        /// Signals every watcher and waits for all of them to be dropped.
        /// Returns immediately on later calls.
        pub async fn start_drain_and_wait(&mut self) {
            self.start_drain();
            match self.drained_rx.recv().await {
                None => {}
                Some(n) => match n {},
            }
        }
    }

    impl Handle {
        pub fn start_drain(&self) {
            self.0.send_replace(true);
        }
    }

    impl Watch {
        /// Completes once a stop has been signaled. A dropped trigger counts as a stop.
        pub async fn signaled(&self) {
            let mut rx = self.signal_rx.clone();
            let _ = rx.wait_for(|draining| *draining).await;
        }

        pub fn is_signaled(&self) -> bool {
            *self.signal_rx.borrow()
        }
    }

    impl std::fmt::Debug for Signal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Signal")
                .field("draining", &self.is_draining())
                .finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for Handle {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Handle").finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for Watch {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Watch").finish_non_exhaustive()
        }
    }
}
