//! Location liveness heartbeat

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::RemoteClient;

/// Default time between pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically tells the tracking API this location's workers are online
pub struct Pinger {
    client: RemoteClient,
    interval: Duration,
}

impl Pinger {
    /// Pinger on the default interval
    pub fn new(client: RemoteClient) -> Self {
        Self {
            client,
            interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Override the interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Ping immediately, then on every interval until `stop` is cancelled
    ///
    /// Failures are logged and never stop the loop.
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.client.ping().await {
                Ok(()) => debug!(region = %self.client.region(), "ping acknowledged"),
                Err(e) => warn!(region = %self.client.region(), error = %e, "ping failed"),
            }
        }
        debug!("pinger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::put;
    use axum::Router;

    use crate::ClientConfig;

    #[tokio::test]
    async fn pings_until_stopped_and_survives_failures() {
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/api/workers/{location}/ping",
                put(|State(hits): State<Arc<AtomicU32>>| async move {
                    // first answer is an error; the loop must keep going
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = RemoteClient::new(
            ClientConfig::new("eu-west").with_endpoint(format!("http://{}/api", addr)),
            Arc::new(crate::default_registry()),
        )
        .unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(
            Pinger::new(client)
                .with_interval(Duration::from_millis(30))
                .run(stop.clone()),
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }
}
