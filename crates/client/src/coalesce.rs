//! Single-slot request coalescing.
//!
//! While an operation is in flight, later callers await the same pending
//! result instead of starting a duplicate. Once it settles the slot empties
//! and the next caller starts a fresh run.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use swarmroute_core::Result;
use tracing::debug;

type Pending<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Slot<T: Clone> {
    generation: u64,
    pending: Option<Pending<T>>,
}

/// Named "only one in flight" guard
pub struct SingleFlight<T: Clone> {
    name: &'static str,
    slot: Mutex<Slot<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot {
                generation: 0,
                pending: None,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Run `start()` unless a run is already pending, in which case join it.
    ///
    /// `start` is only invoked by the caller that opens a new run.
    pub async fn run<F, Fut>(&self, start: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (generation, pending) = {
            let mut slot = self.slot.lock();
            match &slot.pending {
                Some(pending) => {
                    debug!("{}: joining in-flight run", self.name);
                    (slot.generation, pending.clone())
                }
                None => {
                    slot.generation += 1;
                    let pending = start().boxed().shared();
                    slot.pending = Some(pending.clone());
                    (slot.generation, pending)
                }
            }
        };

        let result = pending.await;

        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.pending = None;
        }
        result
    }
}
