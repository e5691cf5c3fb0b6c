use crate::error::{HandlerError, MessagingError};

/// Property naming why a message was dead-lettered.
pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
/// Property naming the topic a dead-lettered message came from.
pub const ORIGINAL_TOPIC: &str = "x-original-topic";
/// Property carrying the broker id of the dead-lettered message.
pub const ORIGINAL_MESSAGE_ID: &str = "x-original-message-id";

/// How a subscriber settles deliveries that were not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Redeliver transient failures up to `max_redeliveries` times, then
    /// dead-letter. Permanent failures are dead-lettered right away.
    Redeliver { max_redeliveries: u32 },
    /// Acknowledge every delivery whatever the outcome.
    AcknowledgeOnFailure,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Redeliver {
            max_redeliveries: 5,
        }
    }
}

/// Result of running one delivery through validation and its handler.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Handled,
    /// The handler returned `false`.
    Declined,
    /// Envelope, type or schema checks failed.
    Rejected(MessagingError),
    HandlerFailed(HandlerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    NegativeAcknowledge,
    DeadLetter { reason: String },
}

impl FailurePolicy {
    pub fn disposition(
        &self,
        outcome: &DeliveryOutcome,
        redelivery_count: u32,
    ) -> Disposition {
        let max_redeliveries = match (self, outcome) {
            (_, DeliveryOutcome::Handled) => return Disposition::Acknowledge,
            (FailurePolicy::AcknowledgeOnFailure, _) => {
                return Disposition::Acknowledge;
            }
            (FailurePolicy::Redeliver { max_redeliveries }, _) => {
                *max_redeliveries
            }
        };
        let exhausted = redelivery_count >= max_redeliveries;
        match outcome {
            DeliveryOutcome::Handled => Disposition::Acknowledge,
            DeliveryOutcome::Rejected(err) => Disposition::DeadLetter {
                reason: err.to_string(),
            },
            DeliveryOutcome::Declined if exhausted => Disposition::DeadLetter {
                reason: format!(
                    "handler declined message after {redelivery_count} redeliveries"
                ),
            },
            DeliveryOutcome::Declined => Disposition::NegativeAcknowledge,
            DeliveryOutcome::HandlerFailed(err) if !err.retryable => {
                Disposition::DeadLetter {
                    reason: err.message.clone(),
                }
            }
            DeliveryOutcome::HandlerFailed(err) if exhausted => {
                Disposition::DeadLetter {
                    reason: format!(
                        "{} (gave up after {redelivery_count} redeliveries)",
                        err.message
                    ),
                }
            }
            DeliveryOutcome::HandlerFailed(_) => Disposition::NegativeAcknowledge,
        }
    }
}
