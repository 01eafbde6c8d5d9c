use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// State shared by every task of one acquisition run.
#[derive(Clone, Debug, Default)]
pub struct FetchState {
    /// Output files claimed by a task this run. The same lock serializes the
    /// existence check and the save step.
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    provider_calls: Arc<AtomicUsize>,
}

impl FetchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for this task. Returns `false` when the file already
    /// exists on disk or another task of this run owns it.
    pub async fn claim(&self, path: &Path) -> bool {
        let mut claimed = self.claimed.lock().await;
        if claimed.contains(path) || tokio::fs::try_exists(path).await.unwrap_or(false) {
            return false;
        }
        claimed.insert(path.to_path_buf());
        true
    }

    /// Holds the save lock; no other task checks or writes files meanwhile.
    pub async fn save_lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.claimed.lock().await
    }

    /// Marks one provider call as in flight until the guard drops.
    pub fn enter_flight(&self) -> FlightGuard {
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        FlightGuard { in_flight: self.in_flight.clone() }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn provider_calls(&self) -> usize {
        self.provider_calls.load(Ordering::Relaxed)
    }
}

pub struct FlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
