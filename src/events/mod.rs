use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Handle used by services to emit events without knowing who consumes them.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates an event channel with the given capacity.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

// The events the order pipeline can emit. Delivery (emails, operator
// dashboards) is the consumer's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderPlaced(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    OrderRefunded {
        order_id: Uuid,
        transaction_id: Uuid,
    },

    // Payment events
    PaymentInitiated {
        order_id: Uuid,
        transaction_id: Uuid,
    },
    PaymentSucceeded {
        order_id: Uuid,
        transaction_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        order_id: Uuid,
        transaction_id: Uuid,
        reason: String,
    },

    // Fulfillment side effects
    StockCommitFailed {
        order_id: Uuid,
        transaction_id: Uuid,
    },
    InvoiceCreated {
        invoice_id: Uuid,
        order_id: Uuid,
    },
}

// Consumes events from the channel and hands them to the notification side.
// Here that means structured logs; a deployment wires real delivery in.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderPlaced(order_id) => {
                info!(%order_id, "order placed");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::OrderCancelled(order_id) => {
                info!(%order_id, "order cancelled");
            }
            Event::OrderRefunded {
                order_id,
                transaction_id,
            } => {
                info!(%order_id, %transaction_id, "order refunded");
            }
            Event::PaymentInitiated {
                order_id,
                transaction_id,
            } => {
                info!(%order_id, %transaction_id, "payment initiated");
            }
            Event::PaymentSucceeded {
                order_id,
                transaction_id,
                amount,
            } => {
                info!(%order_id, %transaction_id, %amount, "payment succeeded");
            }
            Event::PaymentFailed {
                order_id,
                transaction_id,
                reason,
            } => {
                info!(%order_id, %transaction_id, %reason, "payment failed");
            }
            Event::StockCommitFailed {
                order_id,
                transaction_id,
            } => {
                warn!(%order_id, %transaction_id, "stock commit failed after successful payment");
            }
            Event::InvoiceCreated {
                invoice_id,
                order_id,
            } => {
                info!(%invoice_id, %order_id, "invoice created");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (sender, mut rx) = channel(8);
        let order_id = Uuid::new_v4();
        sender.send(Event::OrderPlaced(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderPlaced(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (sender, rx) = channel(1);
        drop(rx);
        assert!(sender.send(Event::OrderPlaced(Uuid::new_v4())).await.is_err());
    }
}
