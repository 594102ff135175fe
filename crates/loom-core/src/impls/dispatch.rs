//! QueueDispatcher - delivers ASYNC results by publishing them to a topic.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ports::{Delivery, DispatchError, QueueClient, ResultDispatcher};

pub struct QueueDispatcher {
    client: Arc<dyn QueueClient>,
    topic: String,
}

impl QueueDispatcher {
    pub fn new(client: Arc<dyn QueueClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl ResultDispatcher for QueueDispatcher {
    async fn deliver(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let body = serde_json::to_value(&delivery)?;
        self.client.send_message(&self.topic, body).await
    }
}
