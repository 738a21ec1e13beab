//! Tower control client.
//!
//! Fire-and-forget event delivery to Tower's ingest endpoint. Playout
//! callbacks enqueue; a dedicated worker task posts with a 100 ms
//! timeout so the audio path never waits on the network. Ordering is
//! preserved by the single worker.

use tokio::sync::mpsc;

use crate::models::TowerEvent;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Clone)]
pub struct TowerControlClient {
    tx: mpsc::UnboundedSender<TowerEvent>,
}

impl TowerControlClient {
    /// Spawn the posting worker. Must be called inside a tokio runtime.
    pub fn spawn(ingest_url: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TowerEvent>();

        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!("failed to build Tower event client: {e}");
                    return;
                }
            };

            while let Some(event) = rx.recv().await {
                let event_type = event.event_type.as_str();
                match client.post(&ingest_url).json(&event).send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(event_type, "event delivered to Tower");
                    }
                    Ok(response) => {
                        tracing::warn!(
                            event_type,
                            status = %response.status(),
                            "Tower refused event"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(event_type, "Tower unreachable, event dropped: {e}");
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queue an event for delivery. Non-blocking; a dead worker means the
    /// event is dropped, which is the contract.
    pub fn send(&self, event: TowerEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    #[tokio::test]
    async fn send_never_blocks_when_tower_is_down() {
        let client = TowerControlClient::spawn("http://127.0.0.1:1/tower/events/ingest".into());
        for _ in 0..100 {
            client.send(TowerEvent::new(
                EventType::SegmentPlaying,
                serde_json::json!({}),
            ));
        }
        // Give the worker a beat; nothing should panic or hang.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
