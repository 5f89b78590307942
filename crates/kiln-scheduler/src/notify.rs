//! Notifier over an in-process channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use kiln_core::{Error, Notifier, Outbound, Result, Task};

/// Something handed to the upstream side of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Publish { message: Outbound },
    Redeliver { task: Task },
}

/// Forwards publications and redeliveries to a channel. The receiving end
/// decides how they reach the message source.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelNotifier {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    async fn send(&self, delivery: Delivery) -> Result<()> {
        self.tx
            .send(delivery)
            .await
            .map_err(|_| Error::Internal("notification channel closed".to_string()))
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn publish(&self, message: Outbound) -> Result<()> {
        self.send(Delivery::Publish { message }).await
    }

    async fn redeliver(&self, task: Task) -> Result<()> {
        self.send(Delivery::Redeliver { task }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_redeliver_reaches_receiver() {
        let (notifier, mut rx) = ChannelNotifier::new(4);
        let task = Task::new("build-from-image", json!({})).with_id("t-1");
        notifier.redeliver(task).await.unwrap();

        match rx.recv().await.unwrap() {
            Delivery::Redeliver { task } => assert_eq!(task.id.as_str(), "t-1"),
            other => panic!("unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (notifier, rx) = ChannelNotifier::new(1);
        drop(rx);
        let err = notifier
            .redeliver(Task::new("gc", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_delivery_wire_format() {
        let delivery = Delivery::Publish {
            message: Outbound::ShareResult {
                event_id: "ev".into(),
                share_id: "sh".into(),
                success: true,
                location: None,
                message: "ok".into(),
            },
        };
        let value = serde_json::to_value(&delivery).unwrap();
        assert_eq!(value["type"], "publish");
        assert_eq!(value["message"]["kind"], "share_result");
    }
}
