//! Queue poller
//!
//! A single long-running loop that reads one message per iteration and hands
//! it to the manager over the event channel. The channel send is the only
//! backpressure mechanism: when no worker slot is accepting, the poller blocks
//! on the send and stops pulling from the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::event::QueueMessage;
use crate::metrics;
use crate::queue::MessageQueue;

/// Poll the queue forever, forwarding messages to the event channel. Receive
/// errors are logged and retried after one polling interval. Returns when the
/// receiving side of the channel is gone.
pub(crate) async fn run(
    queue: Arc<dyn MessageQueue>,
    queue_url: String,
    polling_interval_seconds: i64,
    events: mpsc::Sender<QueueMessage>,
) {
    let retry_sleep = Duration::from_secs(polling_interval_seconds.max(1) as u64);
    loop {
        let alive_tasks = tokio::runtime::Handle::current().metrics().num_alive_tasks();
        metrics::ACTIVE_TASKS.set(alive_tasks as i64);
        debug!(alive_tasks, "polling for messages from queue");

        match queue.receive_one(&queue_url, polling_interval_seconds).await {
            Ok(messages) => {
                if messages.is_empty() {
                    debug!("no messages received in interval");
                }
                for message in messages {
                    if events.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                error!(queue_url = %queue_url, error = %err, "unable to receive message from queue");
                tokio::time::sleep(retry_sleep).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubQueue;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_poller_delivers_messages() {
        let message = QueueMessage {
            body: "message-body".to_string(),
            receipt_handle: "receipt".to_string(),
        };
        let queue = Arc::new(StubQueue {
            messages: Mutex::new(vec![message]),
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(run(queue.clone(), "some-queue".to_string(), 1, tx));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(queue.times_called_receive.load(Ordering::SeqCst) > 0);
        let delivered = rx.recv().await.expect("expected a message on the channel");
        assert_eq!(delivered.body, "message-body");
    }
}
