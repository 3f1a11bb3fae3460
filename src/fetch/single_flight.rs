use std::collections::HashMap;
use std::future::Future;

use log::debug;
use tokio::sync::{broadcast, Mutex};

use crate::error::{AppError, Result};

/// Deduplicates concurrent work on the same key: the first caller becomes
/// the leader and runs the work, later callers subscribe and await the
/// leader's result. Used by the fetcher so overlapping requests for one
/// symbol issue a single network call.
pub struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<std::result::Result<T, String>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F>(&self, key: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let followed = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = followed {
            debug!("Joining in-flight request for {}", key);
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(AppError::Message(message)),
                Err(_) => Err(AppError::message(format!(
                    "In-flight request for {} was dropped",
                    key
                ))),
            };
        }

        let result = work.await;

        let sender = self.inflight.lock().await.remove(key);
        if let Some(tx) = sender {
            let shared = match &result {
                Ok(value) => Ok(value.clone()),
                Err(err) => Err(err.to_string()),
            };
            let _ = tx.send(shared);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn followers_share_the_leaders_result() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let lead = {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .run("AAPL", async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            })
        };

        // Give the leader a chance to register before the follower joins.
        tokio::task::yield_now().await;

        let follow = {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .run("AAPL", async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(99)
                    })
                    .await
            })
        };

        let (lead, follow) = tokio::join!(lead, follow);
        assert_eq!(lead.unwrap().unwrap(), 7);
        assert_eq!(follow.unwrap().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flight = SingleFlight::<u32>::new();
        let calls = AtomicUsize::new(0);

        let first = flight
            .run("AAPL", async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        let second = flight
            .run("MSFT", async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_calls_rerun_the_work() {
        let flight = SingleFlight::<u32>::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            flight
                .run("AAPL", async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_error_reaches_followers() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let lead = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("AAPL", async {
                        sleep(Duration::from_millis(50)).await;
                        Err(AppError::message("upstream exploded"))
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;

        let follow = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("AAPL", async { Ok(5) }).await })
        };

        let (lead, follow) = tokio::join!(lead, follow);
        assert!(lead.unwrap().is_err());
        let err = follow.unwrap().expect_err("follower sees the failure");
        assert!(err.to_string().contains("upstream exploded"));
    }
}
