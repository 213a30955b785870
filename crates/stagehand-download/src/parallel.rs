use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::{Client, CleanupTracker, DownloadError};

/// One download slot of a `fetch_many` call. Items without a URL succeed
/// without touching the network (their file is expected to exist already).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub name: String,
    pub url: Option<String>,
    pub destination: PathBuf,
    pub expected_hash: Option<String>,
    pub retries: u32,
    pub retry_wait: Duration,
}

impl Client {
    /// Download every request with at most `max_concurrency` transfers in
    /// flight (zero means unbounded). Results are slotted at the index of
    /// their request, so callers observe input order regardless of
    /// completion order. When `cleanup_on_failure` is set and any request
    /// failed, destinations that never completed are removed.
    pub fn fetch_many(
        &self,
        requests: &[FetchRequest],
        max_concurrency: usize,
        cleanup_on_failure: bool,
    ) -> Vec<Result<(), DownloadError>> {
        if requests.is_empty() {
            return Vec::new();
        }

        let workers = if max_concurrency == 0 {
            requests.len()
        } else {
            max_concurrency.min(requests.len())
        };

        let tracker = CleanupTracker::new();
        let next = AtomicUsize::new(0);
        let slots: Vec<Mutex<Option<Result<(), DownloadError>>>> =
            requests.iter().map(|_| Mutex::new(None)).collect();

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(request) = requests.get(index) else {
                        break;
                    };

                    let outcome = match &request.url {
                        Some(url) => {
                            tracing::debug!(item = request.name.as_str(), url, "starting download");
                            tracker.track(&request.destination);
                            let result = self.fetch(
                                url,
                                &request.destination,
                                request.expected_hash.as_deref(),
                                request.retries,
                                request.retry_wait,
                            );
                            if result.is_ok() {
                                tracker.mark_succeeded(&request.destination);
                            }
                            result
                        }
                        None => Ok(()),
                    };

                    *slots[index].lock().expect("result slot poisoned") = Some(outcome);
                });
            }
        });

        let results: Vec<Result<(), DownloadError>> = slots
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .expect("result slot poisoned")
                    .expect("worker filled every claimed slot")
            })
            .collect();

        let failed = results.iter().filter(|result| result.is_err()).count();
        if cleanup_on_failure && failed > 0 {
            let removed = tracker.cleanup();
            tracing::info!(failed, removed, "cleaned up after failed downloads");
        }

        results
    }
}
