//! QueueClient port - outbound message-queue publisher.
//!
//! Only the publishing side is modelled; broker-specific clients live
//! outside this crate.

use async_trait::async_trait;
use serde::Serialize;

use super::DispatchError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn send_message(
        &self,
        topic: &str,
        body: serde_json::Value,
    ) -> Result<(), DispatchError>;
}
