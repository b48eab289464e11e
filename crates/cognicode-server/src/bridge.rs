use std::sync::Arc;

use cognicode_engine::EventReceiver;

use crate::client::{ClientId, ClientRegistry};
use crate::wire;

/// Forwards one session's job events to the WebSocket client it is bound to.
///
/// The pump ends when the session drops its sender (detach or reattach to a
/// newer connection) or when the client goes away. An event the client never
/// got has its receipt withdrawn, so the next resume replays it.
pub fn spawn_session_pump(
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
    mut rx: EventReceiver,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(frame) = wire::encode_event(&event) else {
                tracing::warn!(job_id = %event.job_id(), "failed to encode job event");
                continue;
            };
            if !registry.deliver(&client_id, frame).await {
                rx.undeliverable(&event);
                tracing::debug!(client_id = %client_id, "client gone, stopping session pump");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognicode_core::{JobEvent, JobId};
    use cognicode_engine::{event_channel, ChannelSession, JobSubscriber};
    use serde_json::Value;

    fn cancelled(job: &str, sequence: u64) -> JobEvent {
        JobEvent::Cancelled {
            job_id: JobId::from_raw(job),
            sequence,
        }
    }

    #[tokio::test]
    async fn pump_forwards_in_order() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (client_id, mut client_rx) = registry.register();
        let (tx, rx) = event_channel();
        let handle = spawn_session_pump(registry, client_id, rx);

        tx.send(cancelled("job_a", 1)).unwrap();
        tx.send(cancelled("job_b", 2)).unwrap();
        drop(tx);
        handle.await.unwrap();

        for (job, seq) in [("job_a", 1), ("job_b", 2)] {
            let frame: Value = serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["jobId"], job);
            assert_eq!(frame["sequence"], seq);
        }
    }

    #[tokio::test]
    async fn pump_stops_when_client_is_gone() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (client_id, _client_rx) = registry.register();
        registry.unregister(&client_id);

        let (tx, rx) = event_channel();
        let handle = spawn_session_pump(registry, client_id, rx);
        tx.send(cancelled("job_a", 1)).unwrap();
        handle.await.unwrap();
        assert!(tx.send(cancelled("job_a", 2)).is_err());
    }

    #[tokio::test]
    async fn event_lost_to_a_dead_client_is_replayed_on_resume() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (client_id, mut client_rx) = registry.register();
        let (tx, rx) = event_channel();
        let session = ChannelSession::new(tx);
        let handle = spawn_session_pump(registry.clone(), client_id.clone(), rx);

        let (seen, lost) = (JobId::from_raw("job_a"), JobId::from_raw("job_b"));
        session.on_subscribed(&seen, None, 1);
        session.on_subscribed(&lost, None, 1);
        session.deliver(&cancelled("job_a", 1));
        client_rx.recv().await.unwrap();
        registry.unregister(&client_id);
        session.deliver(&cancelled("job_b", 1));
        handle.await.unwrap();

        session.detach();
        let (tx, _rx) = event_channel();
        session.attach(tx);
        assert_eq!(session.subscriptions(), vec![lost.clone()]);
        assert_eq!(session.cursor(&lost), 0);
    }
}
