//! Consumers for the backend's own queues.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::consumer::{MessageConsumer, ProcessOutcome};
use crate::envelope::Envelope;
use crate::error::MqError;

/// Queue carrying user creation requests
pub const CREATE_USER_QUEUE: &str = "create_user";

/// Body of a `create_user` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
}

/// Handles `create_user` deliveries
///
/// ```rust
/// use sesamo_mq::consumer::MessageConsumer;
/// use sesamo_mq::consumers::{CreateUserConsumer, NewUser};
/// use sesamo_mq::envelope::Envelope;
///
/// let consumer = CreateUserConsumer::new();
/// let message = Envelope::new(
///     7,
///     "create_user",
///     NewUser { first_name: "Ana".into(), last_name: "Silva".into() },
/// );
///
/// let outcome = tokio_test::block_on(consumer.process(message));
/// assert!(outcome.is_success());
/// assert_eq!(outcome.delivery_id, 7);
/// ```
#[derive(Debug, Default, Clone)]
pub struct CreateUserConsumer;

impl CreateUserConsumer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageConsumer<NewUser> for CreateUserConsumer {
    async fn process(&self, message: Envelope<NewUser>) -> ProcessOutcome {
        let user = &message.body;

        if user.first_name.trim().is_empty() || user.last_name.trim().is_empty() {
            return ProcessOutcome::failure(
                message.delivery_id,
                MqError::consumer(anyhow::anyhow!("first_name and last_name are required")),
            );
        }

        // TODO: persist through the user service once it is exposed to the listener
        info!(
            delivery_id = message.delivery_id,
            last_name = %user.last_name,
            "Processing message for new user"
        );
        ProcessOutcome::success(message.delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_names_fail_with_delivery_id() {
        let consumer = CreateUserConsumer::new();
        let message = Envelope::new(
            3,
            CREATE_USER_QUEUE,
            NewUser {
                first_name: "Ana".to_string(),
                last_name: " ".to_string(),
            },
        );

        let outcome = consumer.process(message).await;

        assert_eq!(outcome.delivery_id, 3);
        assert!(matches!(outcome.result, Err(MqError::Consumer(_))));
    }
}
