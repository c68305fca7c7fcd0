//! Downstream participants driven by saga commands.
//!
//! [`Downstream`] consumes the command topics, calls the matching service and
//! publishes the result event back to the saga. Commands are processed at
//! most once per idempotency key; a redelivered command gets the cached
//! result event again without repeating the side effect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use domain::fulfillment::{EVENTS_TOPIC, topics};
use domain::{FulfillmentCommand, FulfillmentEvent, WorkflowCommand};
use futures_util::future::select_all;
use tokio::sync::watch;

use crate::bus::{BusMessage, BusSubscription, EventBus};
use crate::error::{Result, SagaError};
use crate::services::inventory::{InMemoryInventoryService, InventoryService};
use crate::services::notification::{
    InMemoryNotificationService, InMemoryOrderStatusService, Notification, NotificationService,
    OrderStatusService,
};
use crate::services::payment::{InMemoryPaymentService, PaymentService};
use crate::services::shipping::{InMemoryShippingService, ShippingService};

/// Downstream stand-ins backed by the in-memory services.
pub type InMemoryDownstream = Downstream<
    InMemoryInventoryService,
    InMemoryPaymentService,
    InMemoryShippingService,
    InMemoryNotificationService,
    InMemoryOrderStatusService,
>;

/// Routes fulfillment commands to the downstream services.
pub struct Downstream<I, P, Sh, N, O>
where
    I: InventoryService,
    P: PaymentService,
    Sh: ShippingService,
    N: NotificationService,
    O: OrderStatusService,
{
    inventory: I,
    payment: P,
    shipping: Sh,
    notifications: N,
    orders: O,
    processed: Arc<Mutex<HashMap<String, Option<FulfillmentEvent>>>>,
}

impl InMemoryDownstream {
    /// Creates downstream stand-ins with fresh in-memory services.
    pub fn in_memory() -> Self {
        Self::new(
            InMemoryInventoryService::new(),
            InMemoryPaymentService::new(),
            InMemoryShippingService::new(),
            InMemoryNotificationService::new(),
            InMemoryOrderStatusService::new(),
        )
    }
}

impl<I, P, Sh, N, O> Downstream<I, P, Sh, N, O>
where
    I: InventoryService,
    P: PaymentService,
    Sh: ShippingService,
    N: NotificationService,
    O: OrderStatusService,
{
    pub fn new(inventory: I, payment: P, shipping: Sh, notifications: N, orders: O) -> Self {
        Self {
            inventory,
            payment,
            shipping,
            notifications,
            orders,
            processed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    pub fn payment(&self) -> &P {
        &self.payment
    }

    pub fn shipping(&self) -> &Sh {
        &self.shipping
    }

    pub fn notifications(&self) -> &N {
        &self.notifications
    }

    pub fn orders(&self) -> &O {
        &self.orders
    }

    /// Subscribes to every command topic.
    pub fn subscribe<B: EventBus>(bus: &B) -> Vec<BusSubscription> {
        topics::ALL.iter().map(|topic| bus.subscribe(topic)).collect()
    }

    /// Handles one command message. Returns the result event to publish, if any.
    #[tracing::instrument(skip(self, message), fields(command_type = %message.message_type, correlation_id = %message.key))]
    pub async fn handle(&self, message: &BusMessage) -> Result<Option<FulfillmentEvent>> {
        let key = message
            .idempotency_key
            .clone()
            .unwrap_or_else(|| message.id.to_string());

        if let Some(cached) = self.processed.lock().unwrap().get(&key) {
            tracing::debug!(idempotency_key = %key, "duplicate command, replaying result");
            metrics::counter!("downstream_duplicate_commands_total").increment(1);
            return Ok(cached.clone());
        }

        let command: FulfillmentCommand = serde_json::from_value(message.payload.clone())?;
        if command.command_type() != message.message_type {
            return Err(SagaError::UnknownCommand(message.message_type.clone()));
        }
        metrics::counter!(
            "downstream_commands_total",
            "command_type" => command.command_type()
        )
        .increment(1);

        let result = self.execute(&command).await;
        self.processed.lock().unwrap().insert(key, result.clone());
        Ok(result)
    }

    /// Handles every queued message on `subscriptions` and publishes the
    /// result events. Returns the number of commands handled.
    pub async fn pump<B: EventBus>(
        &self,
        subscriptions: &mut [BusSubscription],
        bus: &B,
    ) -> Result<usize> {
        let mut handled = 0;
        for subscription in subscriptions.iter_mut() {
            while let Some(message) = subscription.try_recv() {
                self.process(&message, bus).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Serves `subscriptions` until `shutdown` changes.
    ///
    /// Subscribe with [`Downstream::subscribe`] before commands can be
    /// relayed, otherwise they are published to nobody.
    pub async fn run<B: EventBus>(
        &self,
        mut subscriptions: Vec<BusSubscription>,
        bus: &B,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(topics = subscriptions.len(), "downstream services started");

        loop {
            tokio::select! {
                message = next_message(&mut subscriptions) => {
                    let Some(message) = message else { break };
                    if let Err(e) = self.process(&message, bus).await {
                        tracing::error!(error = %e, command_type = %message.message_type, "command handling failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("downstream services stopped");
    }

    async fn process<B: EventBus>(&self, message: &BusMessage, bus: &B) -> Result<()> {
        if let Some(event) = self.handle(message).await? {
            bus.publish(BusMessage::event(EVENTS_TOPIC, &event)?).await?;
        }
        Ok(())
    }

    async fn execute(&self, command: &FulfillmentCommand) -> Option<FulfillmentEvent> {
        match command {
            FulfillmentCommand::ReserveInventory { order_id, lines } => {
                Some(match self.inventory.reserve(order_id, lines).await {
                    Ok(reservation_id) => {
                        FulfillmentEvent::inventory_reserved(order_id.clone(), reservation_id)
                    }
                    Err(e) => {
                        FulfillmentEvent::inventory_reservation_failed(order_id.clone(), e.to_string())
                    }
                })
            }
            FulfillmentCommand::RequestPayment { order_id, amount } => {
                Some(match self.payment.charge(order_id, *amount).await {
                    Ok(receipt) => FulfillmentEvent::payment_succeeded(
                        order_id.clone(),
                        receipt.payment_reference,
                        receipt.amount,
                    ),
                    Err(e) => FulfillmentEvent::payment_failed(order_id.clone(), e.to_string()),
                })
            }
            FulfillmentCommand::RequestShipment { order_id, lines } => {
                Some(match self.shipping.create_shipment(order_id, lines).await {
                    Ok(tracking) => FulfillmentEvent::shipment_created(order_id.clone(), tracking),
                    Err(e) => FulfillmentEvent::shipment_failed(order_id.clone(), e.to_string()),
                })
            }
            FulfillmentCommand::ReleaseInventory {
                order_id,
                reservation_id,
            } => {
                let result = self
                    .inventory
                    .release(order_id, reservation_id.as_deref())
                    .await;
                compensation_result(command, result)
            }
            FulfillmentCommand::RefundPayment {
                order_id,
                payment_reference,
                amount,
            } => {
                let result = self
                    .payment
                    .refund(order_id, payment_reference.as_deref(), *amount)
                    .await;
                compensation_result(command, result)
            }
            FulfillmentCommand::UpdateOrderStatus { order_id, status } => {
                let result = self.orders.update_status(order_id, *status).await;
                compensation_result(command, result)
            }
            FulfillmentCommand::NotifyCustomerShipped {
                order_id,
                customer_email,
                tracking_number,
            } => {
                let body = format!("Your order {order_id} has shipped, tracking {tracking_number}");
                self.notify(order_id, customer_email, body).await;
                None
            }
            FulfillmentCommand::NotifyCustomerCancelled {
                order_id,
                customer_email,
                reason,
            } => {
                let body = format!("Your order {order_id} was cancelled: {reason}");
                self.notify(order_id, customer_email, body).await;
                None
            }
        }
    }

    async fn notify(&self, order_id: &common::BusinessKey, customer_email: &str, body: String) {
        let notification = Notification {
            order_id: order_id.clone(),
            customer_email: customer_email.to_string(),
            body,
        };
        if let Err(e) = self.notifications.notify(notification).await {
            tracing::warn!(error = %e, %order_id, "customer notification failed");
        }
    }
}

/// Compensations and status pushes emit nothing on success. A failed
/// compensation is reported back so the saga can escalate it.
fn compensation_result(
    command: &FulfillmentCommand,
    result: std::result::Result<(), SagaError>,
) -> Option<FulfillmentEvent> {
    match result {
        Ok(()) => None,
        Err(e) if command.is_compensation() => Some(FulfillmentEvent::compensation_failed(
            command.business_key(),
            command.command_type(),
            e.to_string(),
        )),
        Err(e) => {
            tracing::warn!(error = %e, command_type = command.command_type(), "command failed");
            None
        }
    }
}

async fn next_message(subscriptions: &mut [BusSubscription]) -> Option<BusMessage> {
    let receives = subscriptions.iter_mut().map(|s| Box::pin(s.recv()));
    let (message, _, _) = select_all(receives).await;
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use common::BusinessKey;
    use domain::{Money, OrderLine, OrderStatus};
    use saga_store::{OutboxMessage, Version};

    fn command_message(command: &FulfillmentCommand, version: i64) -> BusMessage {
        let outbox = OutboxMessage::pending(
            "OrderFulfillment",
            command.business_key(),
            Version::new(version),
            command.command_type(),
            command.topic(),
            serde_json::to_value(command).unwrap(),
            command.is_compensation(),
        );
        BusMessage::from_outbox(&outbox)
    }

    fn reserve(id: u64) -> FulfillmentCommand {
        FulfillmentCommand::ReserveInventory {
            order_id: BusinessKey::from(id),
            lines: vec![OrderLine::new("SKU-1", 1)],
        }
    }

    #[tokio::test]
    async fn redelivered_command_has_no_second_side_effect() {
        let downstream = InMemoryDownstream::in_memory();
        let message = command_message(&reserve(1), 1);

        let first = downstream.handle(&message).await.unwrap();
        let second = downstream.handle(&message).await.unwrap();

        assert_eq!(first, second);
        assert!(matches!(first, Some(FulfillmentEvent::InventoryReserved(_))));
        assert_eq!(downstream.inventory().reservation_count(), 1);
    }

    #[tokio::test]
    async fn service_failure_becomes_failure_event() {
        let downstream = InMemoryDownstream::in_memory();
        downstream.payment().set_fail_on_charge(true);
        let command = FulfillmentCommand::RequestPayment {
            order_id: BusinessKey::from(1u64),
            amount: Money::from_major(10),
        };

        let event = downstream
            .handle(&command_message(&command, 2))
            .await
            .unwrap();

        assert!(matches!(event, Some(FulfillmentEvent::PaymentFailed(_))));
    }

    #[tokio::test]
    async fn failed_compensation_is_reported() {
        let downstream = InMemoryDownstream::in_memory();
        downstream.inventory().set_fail_on_release(true);
        let command = FulfillmentCommand::ReleaseInventory {
            order_id: BusinessKey::from(1u64),
            reservation_id: Some("RES-0001".into()),
        };

        let event = downstream
            .handle(&command_message(&command, 3))
            .await
            .unwrap();

        match event {
            Some(FulfillmentEvent::CompensationFailed(data)) => {
                assert_eq!(data.command_type, "ReleaseInventory");
            }
            other => panic!("expected CompensationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_status_update_emits_nothing() {
        let downstream = InMemoryDownstream::in_memory();
        let command = FulfillmentCommand::UpdateOrderStatus {
            order_id: BusinessKey::from(1u64),
            status: OrderStatus::Confirmed,
        };

        let event = downstream
            .handle(&command_message(&command, 3))
            .await
            .unwrap();

        assert!(event.is_none());
        assert_eq!(
            downstream.orders().status_of(&BusinessKey::from(1u64)),
            Some(OrderStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn pump_publishes_result_events() {
        let bus = InMemoryEventBus::new();
        let downstream = InMemoryDownstream::in_memory();
        let mut subscriptions = InMemoryDownstream::subscribe(&bus);
        let mut events = bus.subscribe(EVENTS_TOPIC);

        bus.publish(command_message(&reserve(5), 1)).await.unwrap();
        let handled = downstream.pump(&mut subscriptions, &bus).await.unwrap();

        assert_eq!(handled, 1);
        let result = events.try_recv().unwrap();
        assert_eq!(result.message_type, "InventoryReserved");
        assert_eq!(result.key, BusinessKey::from(5u64));
    }

    #[tokio::test]
    async fn mismatched_type_is_rejected() {
        let downstream = InMemoryDownstream::in_memory();
        let mut message = command_message(&reserve(1), 1);
        message.message_type = "RequestShipment".into();

        assert!(matches!(
            downstream.handle(&message).await,
            Err(SagaError::UnknownCommand(_))
        ));
    }
}
