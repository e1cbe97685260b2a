//! Transport-neutral unit of work handed to the consumer pipeline.
//!
//! Both the push endpoint and the pull loop wrap each message in a [`Delivery`]
//! carrying a one-shot ack/nack handle. The transport owns the matching
//! [`VerdictReceiver`] and applies the verdict once the pipeline is done.

use std::collections::HashMap;

use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Stable across redeliveries of the same message
    pub id: String,
    pub payload: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// 1-based delivery attempt
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Nack,
}

pub struct AckHandle {
    sender: oneshot::Sender<Verdict>,
}

impl AckHandle {
    pub fn ack(self) {
        _ = self.sender.send(Verdict::Ack);
    }

    pub fn nack(self) {
        _ = self.sender.send(Verdict::Nack);
    }
}

pub struct VerdictReceiver {
    receiver: oneshot::Receiver<Verdict>,
}

impl VerdictReceiver {
    /// A handle dropped without a verdict counts as a nack.
    pub async fn verdict(self) -> Verdict {
        self.receiver.await.unwrap_or(Verdict::Nack)
    }
}

pub struct Delivery {
    message: InboundMessage,
    handle: AckHandle,
}

impl Delivery {
    pub fn new(message: InboundMessage) -> (Self, VerdictReceiver) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                message,
                handle: AckHandle { sender },
            },
            VerdictReceiver { receiver },
        )
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub fn into_parts(self) -> (InboundMessage, AckHandle) {
        (self.message, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Delivery, InboundMessage, Verdict};

    fn message() -> InboundMessage {
        InboundMessage {
            id: "stackex-questions-0-12".to_owned(),
            payload: vec![1, 2, 3],
            attributes: HashMap::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn verdicts_reach_the_transport() {
        let (delivery, receiver) = Delivery::new(message());
        let (_, handle) = delivery.into_parts();
        handle.ack();
        assert_eq!(receiver.verdict().await, Verdict::Ack);

        let (delivery, receiver) = Delivery::new(message());
        delivery.into_parts().1.nack();
        assert_eq!(receiver.verdict().await, Verdict::Nack);
    }

    #[tokio::test]
    async fn dropped_handles_nack() {
        let (delivery, receiver) = Delivery::new(message());
        drop(delivery);
        assert_eq!(receiver.verdict().await, Verdict::Nack);
    }
}
