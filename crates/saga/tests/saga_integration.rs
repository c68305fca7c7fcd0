//! Integration tests for the saga engine, relay, consumer and downstream services.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{BusinessKey, MessageId};
use domain::fulfillment::EVENTS_TOPIC;
use domain::{
    FulfillmentEvent, FulfillmentState, GuardViolation, Money, OrderFulfillment, OrderLine,
    OrderStatus, Rejection, Workflow,
};
use saga::{
    BusMessage, BusSubscription, EngineConfig, EventBus, HandleOutcome, InMemoryDownstream,
    InMemoryEventBus, InboundEvent, OutboxRelay, RelayConfig, SagaConsumer, SagaEngine, SagaError,
};
use saga_store::{
    ApplyOutcome, DeadLetter, DeadLetterKind, DeadLetterQuery, InMemorySagaStore, OutboxMessage,
    SagaRecord, SagaStore, SagaStoreExt, StoreError, TransitionLogEntry, TransitionWrite,
};
use tokio::sync::watch;

type Engine = SagaEngine<InMemorySagaStore, OrderFulfillment>;

const SAGA: &str = OrderFulfillment::SAGA_TYPE;

fn created(id: u64, amount: i64) -> FulfillmentEvent {
    FulfillmentEvent::order_created(
        id,
        "customer@example.com",
        Money::from_major(amount),
        vec![OrderLine::new("SKU-001", 2), OrderLine::new("SKU-002", 1)],
    )
}

fn inbound(event: FulfillmentEvent) -> InboundEvent<FulfillmentEvent> {
    InboundEvent::new(event)
}

fn engine_on(store: InMemorySagaStore) -> Engine {
    SagaEngine::new(store, OrderFulfillment::new())
}

async fn state_of(engine: &Engine, id: u64) -> Option<FulfillmentState> {
    engine
        .load(&BusinessKey::from(id))
        .await
        .unwrap()
        .map(|instance| instance.state)
}

async fn command_types(store: &InMemorySagaStore, id: u64) -> Vec<String> {
    store
        .outbox_for(SAGA, &BusinessKey::from(id))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.command_type)
        .collect()
}

fn count(types: &[String], command_type: &str) -> usize {
    types.iter().filter(|t| *t == command_type).count()
}

/// Drives an instance to `AwaitingPayment` with direct engine calls.
async fn to_awaiting_payment(engine: &Engine, id: u64) {
    engine.handle(inbound(created(id, 100))).await.unwrap();
    engine
        .handle(inbound(FulfillmentEvent::inventory_reserved(id, "RES-1")))
        .await
        .unwrap();
}

/// Drives an instance to `AwaitingShipment` with direct engine calls.
async fn to_awaiting_shipment(engine: &Engine, id: u64) {
    to_awaiting_payment(engine, id).await;
    engine
        .handle(inbound(FulfillmentEvent::payment_succeeded(
            id,
            "PAY-1",
            Money::from_major(100),
        )))
        .await
        .unwrap();
}

/// Full pipeline on the in-memory bus, pumped step by step.
struct Harness {
    store: InMemorySagaStore,
    bus: InMemoryEventBus,
    consumer: SagaConsumer<InMemorySagaStore, OrderFulfillment>,
    relay: OutboxRelay<InMemorySagaStore, InMemoryEventBus>,
    downstream: InMemoryDownstream,
    events: BusSubscription,
    commands: Vec<BusSubscription>,
}

impl Harness {
    fn new() -> Self {
        Self::with_relay(RelayConfig::default())
    }

    fn with_relay(config: RelayConfig) -> Self {
        let store = InMemorySagaStore::new();
        let bus = InMemoryEventBus::new();
        let engine = Arc::new(engine_on(store.clone()));
        let events = bus.subscribe(EVENTS_TOPIC);
        let commands = InMemoryDownstream::subscribe(&bus);

        Self {
            consumer: SagaConsumer::new(engine),
            relay: OutboxRelay::with_config(store.clone(), bus.clone(), config),
            downstream: InMemoryDownstream::in_memory(),
            store,
            bus,
            events,
            commands,
        }
    }

    fn engine(&self) -> &Engine {
        self.consumer.engine()
    }

    async fn publish(&self, event: FulfillmentEvent) {
        let message = BusMessage::event(EVENTS_TOPIC, &event).unwrap();
        self.bus.publish(message).await.unwrap();
    }

    /// Runs consumer, relay and downstream until nothing moves.
    async fn settle(&mut self) {
        for _ in 0..32 {
            let handled = self.consumer.drain(&mut self.events).await.unwrap();
            let report = self.relay.relay_once().await.unwrap();
            let commands = self
                .downstream
                .pump(&mut self.commands, &self.bus)
                .await
                .unwrap();
            if handled == 0 && report.dispatched == 0 && commands == 0 {
                return;
            }
        }
        panic!("pipeline did not settle");
    }

    async fn state(&self, id: u64) -> Option<FulfillmentState> {
        state_of(self.engine(), id).await
    }
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn order_created_starts_saga_and_reserves_inventory() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        let outcome = engine.handle(inbound(created(42, 100))).await.unwrap();

        assert!(outcome.is_applied());
        assert_eq!(
            state_of(&engine, 42).await,
            Some(FulfillmentState::AwaitingInventory)
        );
        assert_eq!(command_types(&store, 42).await, vec!["ReserveInventory"]);
    }

    #[tokio::test]
    async fn redelivered_order_created_changes_nothing() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        let event = inbound(created(42, 100));

        engine.handle(event.clone()).await.unwrap();
        let outcome = engine.handle(event).await.unwrap();
        // A fresh delivery of an equal event is a duplicate too
        let again = engine.handle(inbound(created(42, 100))).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(again, HandleOutcome::Duplicate);
        assert_eq!(
            state_of(&engine, 42).await,
            Some(FulfillmentState::AwaitingInventory)
        );
        assert_eq!(command_types(&store, 42).await, vec!["ReserveInventory"]);
        assert_eq!(engine.transition_log(&BusinessKey::from(42u64)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_releases_inventory_exactly_once() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        to_awaiting_payment(&engine, 42).await;

        let failed = inbound(FulfillmentEvent::payment_failed(42u64, "card declined"));
        engine.handle(failed.clone()).await.unwrap();
        let replay = engine.handle(failed).await.unwrap();

        assert_eq!(state_of(&engine, 42).await, Some(FulfillmentState::Cancelled));
        assert!(matches!(
            replay,
            HandleOutcome::Ignored {
                rejection: Rejection::Terminal,
                ..
            }
        ));
        let types = command_types(&store, 42).await;
        assert_eq!(count(&types, "ReleaseInventory"), 1);
        assert_eq!(count(&types, "NotifyCustomerCancelled"), 1);
    }

    #[tokio::test]
    async fn continuing_event_for_unknown_order_is_dead_lettered() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        let outcome = engine
            .handle(inbound(FulfillmentEvent::payment_succeeded(
                99u64,
                "PAY-9",
                Money::from_major(10),
            )))
            .await
            .unwrap();

        assert_eq!(outcome, HandleOutcome::Orphaned);
        assert!(state_of(&engine, 99).await.is_none());
        assert_eq!(store.instance_count().await, 0);

        let letters = store
            .dead_letters(DeadLetterQuery::new().kind(DeadLetterKind::OrphanedEvent))
            .await
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].correlation_id, Some(BusinessKey::from(99u64)));
        assert_eq!(letters[0].event_type.as_deref(), Some("PaymentSucceeded"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_payment_results_have_one_winner() {
        for id in 1..=20u64 {
            let store = InMemorySagaStore::new();
            let engine = Arc::new(engine_on(store.clone()));
            to_awaiting_payment(&engine, id).await;

            let a = Arc::clone(&engine);
            let b = Arc::clone(&engine);
            let succeeded = tokio::spawn(async move {
                a.handle(inbound(FulfillmentEvent::payment_succeeded(
                    id,
                    "PAY-7",
                    Money::from_major(100),
                )))
                .await
                .unwrap()
            });
            let failed = tokio::spawn(async move {
                b.handle(inbound(FulfillmentEvent::payment_failed(id, "declined")))
                    .await
                    .unwrap()
            });
            let (succeeded, failed) = (succeeded.await.unwrap(), failed.await.unwrap());

            assert_ne!(succeeded.is_applied(), failed.is_applied());
            let types = command_types(&store, id).await;
            if succeeded.is_applied() {
                assert!(matches!(failed, HandleOutcome::Ignored { .. }));
                assert_eq!(
                    state_of(&engine, id).await,
                    Some(FulfillmentState::AwaitingShipment)
                );
                assert_eq!(
                    types,
                    vec!["ReserveInventory", "RequestPayment", "RequestShipment", "UpdateOrderStatus"]
                );
            } else {
                assert!(matches!(succeeded, HandleOutcome::Ignored { .. }));
                assert_eq!(state_of(&engine, id).await, Some(FulfillmentState::Cancelled));
                assert_eq!(
                    types,
                    vec![
                        "ReserveInventory",
                        "RequestPayment",
                        "ReleaseInventory",
                        "NotifyCustomerCancelled"
                    ]
                );
            }
        }
    }
}

mod properties {
    use super::*;

    /// Delivers each event twice and checks the second delivery wrote nothing.
    async fn deliver_twice(engine: &Engine, store: &InMemorySagaStore, event: FulfillmentEvent) {
        let key = event_key(&event);
        let first = inbound(event);
        engine.handle(first.clone()).await.unwrap();
        let state = engine.load(&key).await.unwrap().map(|i| (i.state, i.version));
        let outbox = store.outbox_len().await;

        let second = engine.handle(first.clone()).await.unwrap();
        let fresh = engine
            .handle(first.with_message_id(MessageId::new()))
            .await
            .unwrap();

        assert!(!second.is_applied(), "redelivery applied: {second:?}");
        assert!(!fresh.is_applied(), "redelivery applied: {fresh:?}");
        assert_eq!(
            engine.load(&key).await.unwrap().map(|i| (i.state, i.version)),
            state
        );
        assert_eq!(store.outbox_len().await, outbox);
    }

    fn event_key(event: &FulfillmentEvent) -> BusinessKey {
        use domain::WorkflowEvent;
        event.business_key()
    }

    #[tokio::test]
    async fn every_forward_transition_is_idempotent() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        deliver_twice(&engine, &store, created(1, 50)).await;
        deliver_twice(&engine, &store, FulfillmentEvent::inventory_reserved(1u64, "RES-1")).await;
        deliver_twice(
            &engine,
            &store,
            FulfillmentEvent::payment_succeeded(1u64, "PAY-1", Money::from_major(50)),
        )
        .await;
        deliver_twice(&engine, &store, FulfillmentEvent::shipment_created(1u64, "TRACK-1")).await;

        assert_eq!(state_of(&engine, 1).await, Some(FulfillmentState::Completed));
        assert_eq!(
            command_types(&store, 1).await,
            vec![
                "ReserveInventory",
                "RequestPayment",
                "RequestShipment",
                "UpdateOrderStatus",
                "NotifyCustomerShipped"
            ]
        );
    }

    #[tokio::test]
    async fn every_failure_transition_is_idempotent() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        engine.handle(inbound(created(1, 10))).await.unwrap();
        deliver_twice(
            &engine,
            &store,
            FulfillmentEvent::inventory_reservation_failed(1u64, "out of stock"),
        )
        .await;

        to_awaiting_payment(&engine, 2).await;
        deliver_twice(&engine, &store, FulfillmentEvent::payment_failed(2u64, "declined")).await;

        to_awaiting_shipment(&engine, 3).await;
        deliver_twice(&engine, &store, FulfillmentEvent::shipment_failed(3u64, "no carrier")).await;

        to_awaiting_payment(&engine, 4).await;
        deliver_twice(&engine, &store, FulfillmentEvent::cancelled_by_user(4u64, "changed mind")).await;

        to_awaiting_shipment(&engine, 5).await;
        deliver_twice(
            &engine,
            &store,
            FulfillmentEvent::step_timed_out(5u64, FulfillmentState::AwaitingShipment),
        )
        .await;

        for id in 1..=5 {
            assert_eq!(state_of(&engine, id).await, Some(FulfillmentState::Cancelled));
        }
    }

    #[tokio::test]
    async fn continuing_events_never_create_instances() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        let events = vec![
            FulfillmentEvent::inventory_reserved(1u64, "RES-1"),
            FulfillmentEvent::inventory_reservation_failed(2u64, "x"),
            FulfillmentEvent::payment_succeeded(3u64, "PAY-1", Money::from_major(1)),
            FulfillmentEvent::payment_failed(4u64, "x"),
            FulfillmentEvent::shipment_created(5u64, "T"),
            FulfillmentEvent::shipment_failed(6u64, "x"),
            FulfillmentEvent::cancelled_by_user(7u64, "x"),
            FulfillmentEvent::step_timed_out(8u64, FulfillmentState::AwaitingPayment),
        ];
        let total = events.len();
        for event in events {
            let outcome = engine.handle(inbound(event)).await.unwrap();
            assert_eq!(outcome, HandleOutcome::Orphaned);
        }

        assert_eq!(store.instance_count().await, 0);
        assert_eq!(store.outbox_len().await, 0);
        assert_eq!(
            store
                .dead_letters(DeadLetterQuery::new().kind(DeadLetterKind::OrphanedEvent))
                .await
                .unwrap()
                .len(),
            total
        );
        // Orphans are informational, not operator work
        assert!(store.operator_queue(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_instances_accept_nothing() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        to_awaiting_shipment(&engine, 1).await;
        engine
            .handle(inbound(FulfillmentEvent::shipment_created(1u64, "TRACK-1")))
            .await
            .unwrap();
        let before = engine.load(&BusinessKey::from(1u64)).await.unwrap().unwrap();
        let outbox = store.outbox_len().await;

        let events = vec![
            FulfillmentEvent::inventory_reserved(1u64, "RES-2"),
            FulfillmentEvent::payment_failed(1u64, "late"),
            FulfillmentEvent::shipment_failed(1u64, "late"),
            FulfillmentEvent::shipment_created(1u64, "TRACK-2"),
            FulfillmentEvent::cancelled_by_user(1u64, "too late"),
            FulfillmentEvent::step_timed_out(1u64, FulfillmentState::AwaitingShipment),
        ];
        for event in events {
            let outcome = engine.handle(inbound(event)).await.unwrap();
            assert!(
                matches!(
                    outcome,
                    HandleOutcome::Ignored {
                        rejection: Rejection::Terminal,
                        ..
                    }
                ),
                "unexpected {outcome:?}"
            );
        }

        let after = engine.load(&BusinessKey::from(1u64)).await.unwrap().unwrap();
        assert_eq!(after.state, FulfillmentState::Completed);
        assert_eq!(after.version, before.version);
        assert_eq!(after.data.tracking_number.as_deref(), Some("TRACK-1"));
        assert_eq!(store.outbox_len().await, outbox);
    }

    #[tokio::test]
    async fn compensation_matches_completed_steps() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());

        engine.handle(inbound(created(1, 10))).await.unwrap();
        engine
            .handle(inbound(FulfillmentEvent::inventory_reservation_failed(1u64, "x")))
            .await
            .unwrap();

        to_awaiting_payment(&engine, 2).await;
        engine
            .handle(inbound(FulfillmentEvent::payment_failed(2u64, "x")))
            .await
            .unwrap();

        to_awaiting_shipment(&engine, 3).await;
        engine
            .handle(inbound(FulfillmentEvent::shipment_failed(3u64, "x")))
            .await
            .unwrap();

        let compensations = |types: Vec<String>, skip: usize| types[skip..].to_vec();
        assert_eq!(
            compensations(command_types(&store, 1).await, 1),
            vec!["NotifyCustomerCancelled"]
        );
        assert_eq!(
            compensations(command_types(&store, 2).await, 2),
            vec!["ReleaseInventory", "NotifyCustomerCancelled"]
        );
        assert_eq!(
            compensations(command_types(&store, 3).await, 4),
            vec![
                "UpdateOrderStatus",
                "RefundPayment",
                "ReleaseInventory",
                "NotifyCustomerCancelled"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_serialize_per_key() {
        let store = InMemorySagaStore::new();
        let engine = Arc::new(engine_on(store.clone()));

        // Many redeliveries of the same start event plus the next step
        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.handle(inbound(created(7, 30))).await.unwrap()
            }));
        }
        let outcomes: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(outcomes.iter().filter(|o| o.is_applied()).count(), 1);
        assert!(
            outcomes
                .iter()
                .filter(|o| !o.is_applied())
                .all(|o| *o == HandleOutcome::Duplicate)
        );
        assert_eq!(command_types(&store, 7).await, vec!["ReserveInventory"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engines_sharing_a_store_have_one_winner() {
        for id in 1..=20u64 {
            let store = InMemorySagaStore::new();
            let first = Arc::new(engine_on(store.clone()));
            let second = Arc::new(engine_on(store.clone()));
            to_awaiting_payment(&first, id).await;

            let a = Arc::clone(&first);
            let b = Arc::clone(&second);
            let succeeded = tokio::spawn(async move {
                a.handle(inbound(FulfillmentEvent::payment_succeeded(
                    id,
                    "PAY-1",
                    Money::from_major(100),
                )))
                .await
                .unwrap()
            });
            let failed = tokio::spawn(async move {
                b.handle(inbound(FulfillmentEvent::payment_failed(id, "declined")))
                    .await
                    .unwrap()
            });
            let (succeeded, failed) = (succeeded.await.unwrap(), failed.await.unwrap());

            assert_ne!(succeeded.is_applied(), failed.is_applied());
            let instance = first.load(&BusinessKey::from(id)).await.unwrap().unwrap();
            assert_eq!(instance.version.as_i64(), 3);
            assert_eq!(
                first.transition_log(&BusinessKey::from(id)).await.unwrap().len(),
                3
            );

            let types = command_types(&store, id).await;
            let forward = count(&types, "RequestShipment");
            let unwind = count(&types, "ReleaseInventory");
            assert_eq!(forward + unwind, 1);
        }
    }
}

mod guards {
    use super::*;

    #[tokio::test]
    async fn stale_timeout_is_rejected() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        to_awaiting_payment(&engine, 1).await;

        let outcome = engine
            .handle(inbound(FulfillmentEvent::step_timed_out(
                1u64,
                FulfillmentState::AwaitingInventory,
            )))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            HandleOutcome::Ignored {
                rejection: Rejection::Guard(GuardViolation::StaleTimeout { .. }),
                ..
            }
        ));
        assert_eq!(
            state_of(&engine, 1).await,
            Some(FulfillmentState::AwaitingPayment)
        );

        engine
            .handle(inbound(FulfillmentEvent::step_timed_out(
                1u64,
                FulfillmentState::AwaitingPayment,
            )))
            .await
            .unwrap();
        assert_eq!(state_of(&engine, 1).await, Some(FulfillmentState::Cancelled));
        assert_eq!(count(&command_types(&store, 1).await, "ReleaseInventory"), 1);

        let instance = engine.load(&BusinessKey::from(1u64)).await.unwrap().unwrap();
        assert!(instance.data.failure_reason.is_some());
    }

    #[tokio::test]
    async fn reservation_id_is_write_once() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        to_awaiting_payment(&engine, 1).await;

        // A different reservation for an already-advanced instance
        let outcome = engine
            .handle(inbound(FulfillmentEvent::inventory_reserved(1u64, "RES-OTHER")))
            .await
            .unwrap();

        assert!(matches!(outcome, HandleOutcome::Ignored { .. }));
        let instance = engine.load(&BusinessKey::from(1u64)).await.unwrap().unwrap();
        assert_eq!(instance.data.reservation_id.as_deref(), Some("RES-1"));
    }

    #[tokio::test]
    async fn conflicting_start_goes_to_operator() {
        let store = InMemorySagaStore::new();
        let engine = engine_on(store.clone());
        engine.handle(inbound(created(1, 100))).await.unwrap();

        let outcome = engine.handle(inbound(created(1, 999))).await.unwrap();

        assert!(matches!(outcome, HandleOutcome::DataConflict { .. }));
        let queue = store.operator_queue(10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, DeadLetterKind::DataConflict);
        let instance = engine.load(&BusinessKey::from(1u64)).await.unwrap().unwrap();
        assert_eq!(instance.data.amount, Some(Money::from_major(100)));
    }
}

/// Store wrapper with injectable write faults.
#[derive(Clone, Default)]
struct FaultyStore {
    inner: InMemorySagaStore,
    attempts: Arc<AtomicU32>,
    /// Writes that fail with a store error before delegating again.
    failing_writes: Arc<AtomicU32>,
    /// Every conditional write loses.
    always_conflict: bool,
}

impl FaultyStore {
    fn always_conflicting() -> Self {
        Self {
            always_conflict: true,
            ..Default::default()
        }
    }

    fn failing_writes(count: u32) -> Self {
        Self {
            failing_writes: Arc::new(AtomicU32::new(count)),
            ..Default::default()
        }
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SagaStore for FaultyStore {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> saga_store::Result<Option<SagaRecord>> {
        self.inner.load(saga_type, correlation_id).await
    }

    async fn try_apply_transition(&self, write: TransitionWrite) -> saga_store::Result<ApplyOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::InvalidWrite("connection reset".to_string()));
        }
        if self.always_conflict {
            return Ok(ApplyOutcome::VersionConflict {
                expected: write.expected_version,
                actual: write.expected_version.next(),
            });
        }
        self.inner.try_apply_transition(write).await
    }

    async fn transition_log(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> saga_store::Result<Vec<TransitionLogEntry>> {
        self.inner.transition_log(saga_type, correlation_id).await
    }

    async fn outbox_for(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> saga_store::Result<Vec<OutboxMessage>> {
        self.inner.outbox_for(saga_type, correlation_id).await
    }

    async fn pending_outbox(&self, limit: usize) -> saga_store::Result<Vec<OutboxMessage>> {
        self.inner.pending_outbox(limit).await
    }

    async fn mark_dispatched(&self, id: MessageId) -> saga_store::Result<()> {
        self.inner.mark_dispatched(id).await
    }

    async fn record_dispatch_failure(
        &self,
        id: MessageId,
        error: &str,
        give_up: bool,
    ) -> saga_store::Result<OutboxMessage> {
        self.inner.record_dispatch_failure(id, error, give_up).await
    }

    async fn record_dead_letter(&self, letter: DeadLetter) -> saga_store::Result<()> {
        self.inner.record_dead_letter(letter).await
    }

    async fn dead_letters(&self, query: DeadLetterQuery) -> saga_store::Result<Vec<DeadLetter>> {
        self.inner.dead_letters(query).await
    }
}

mod persistence {
    use super::*;

    #[tokio::test]
    async fn conflicts_past_the_budget_fail_transiently() {
        let store = FaultyStore::always_conflicting();
        let engine = SagaEngine::with_config(
            store.clone(),
            OrderFulfillment::new(),
            EngineConfig {
                max_write_attempts: 3,
                ..Default::default()
            },
        );

        let result = engine.handle(inbound(created(1, 10))).await;

        match result {
            Err(SagaError::TransientPersistenceFailure {
                correlation_id,
                attempts,
                ..
            }) => {
                assert_eq!(correlation_id, BusinessKey::from(1u64));
                assert_eq!(attempts, 3);
            }
            other => panic!("expected TransientPersistenceFailure, got {other:?}"),
        }
        assert_eq!(store.attempts(), 3);

        let queue = store.operator_queue(10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, DeadLetterKind::TransientPersistenceFailure);
    }

    #[tokio::test]
    async fn store_error_on_write_is_retried_by_consumer() {
        let store = FaultyStore::failing_writes(1);
        let engine = Arc::new(SagaEngine::new(store.clone(), OrderFulfillment::new()));
        let consumer = SagaConsumer::new(Arc::clone(&engine));
        let bus = InMemoryEventBus::new();
        let subscription = bus.subscribe(EVENTS_TOPIC);
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(async move { consumer.run(subscription, rx).await });

        bus.publish(BusMessage::event(EVENTS_TOPIC, &created(77, 10)).unwrap())
            .await
            .unwrap();

        let key = BusinessKey::from(77u64);
        let mut instance = None;
        for _ in 0..100 {
            instance = engine.load(&key).await.unwrap();
            if instance.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap();

        let instance = instance.expect("event applied after the failed write");
        assert_eq!(instance.state, FulfillmentState::AwaitingInventory);
        assert_eq!(store.attempts(), 2);
        assert!(store.dead_letters(DeadLetterQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistent_store_errors_are_dead_lettered() {
        let store = FaultyStore::failing_writes(u32::MAX);
        let engine = SagaEngine::with_config(
            store.clone(),
            OrderFulfillment::new(),
            EngineConfig {
                max_write_attempts: 3,
                retry_backoff: Duration::ZERO,
            },
        );

        let result = engine.handle(inbound(created(5, 10))).await;

        assert!(matches!(result, Err(SagaError::Store(StoreError::InvalidWrite(_)))));
        assert_eq!(store.attempts(), 3);
        assert_eq!(store.inner.instance_count().await, 0);

        let queue = store.operator_queue(10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, DeadLetterKind::TransientPersistenceFailure);
        assert_eq!(queue[0].correlation_id, Some(BusinessKey::from(5u64)));
        assert_eq!(queue[0].event_type.as_deref(), Some("OrderCreated"));
        assert_eq!(queue[0].payload["type"], "OrderCreated");
        assert!(queue[0].error.contains("connection reset"));
    }

    #[tokio::test]
    async fn losing_write_leaves_no_outbox_rows() {
        let store = FaultyStore::always_conflicting();
        let engine = SagaEngine::new(store.clone(), OrderFulfillment::new());

        assert!(engine.handle(inbound(created(1, 10))).await.is_err());

        assert_eq!(store.inner.instance_count().await, 0);
        assert_eq!(store.inner.outbox_len().await, 0);
        assert!(store.inner.pending_outbox(10).await.unwrap().is_empty());
    }
}

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn happy_path_completes_order() {
        let mut h = Harness::new();
        h.publish(created(42, 100)).await;
        h.settle().await;

        assert_eq!(h.state(42).await, Some(FulfillmentState::Completed));
        let key = BusinessKey::from(42u64);
        assert_eq!(h.downstream.inventory().reservation_count(), 1);
        assert_eq!(h.downstream.payment().payment_count(), 1);
        assert_eq!(h.downstream.shipping().shipment_count(), 1);
        assert_eq!(
            h.downstream.orders().status_of(&key),
            Some(OrderStatus::Confirmed)
        );
        let notes = h.downstream.notifications().sent_to(&key);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].body.contains("TRACK-"));

        let log = h.engine().transition_log(&key).await.unwrap();
        let steps: Vec<_> = log.iter().map(|e| e.to_state.as_str()).collect();
        assert_eq!(
            steps,
            vec!["AwaitingInventory", "AwaitingPayment", "AwaitingShipment", "Completed"]
        );
        assert!(h.store.pending_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shipment_failure_unwinds_every_completed_step() {
        let mut h = Harness::new();
        h.downstream.shipping().set_fail_on_ship(true);
        h.publish(created(42, 100)).await;
        h.settle().await;

        let key = BusinessKey::from(42u64);
        assert_eq!(h.state(42).await, Some(FulfillmentState::Cancelled));
        assert_eq!(h.downstream.inventory().reservation_count(), 0);
        assert_eq!(h.downstream.inventory().released().len(), 1);
        assert_eq!(h.downstream.payment().payment_count(), 0);
        assert_eq!(h.downstream.payment().refunds().len(), 1);
        assert_eq!(
            h.downstream.orders().history_of(&key),
            vec![OrderStatus::Confirmed, OrderStatus::Cancelled]
        );
        let notes = h.downstream.notifications().sent_to(&key);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].body.contains("cancelled"));
    }

    #[tokio::test]
    async fn reservation_failure_cancels_without_compensation() {
        let mut h = Harness::new();
        h.downstream.inventory().set_fail_on_reserve(true);
        h.publish(created(42, 100)).await;
        h.settle().await;

        assert_eq!(h.state(42).await, Some(FulfillmentState::Cancelled));
        assert_eq!(
            command_types(&h.store, 42).await,
            vec!["ReserveInventory", "NotifyCustomerCancelled"]
        );
        let instance = h.engine().load(&BusinessKey::from(42u64)).await.unwrap().unwrap();
        assert!(
            instance
                .data
                .failure_reason
                .unwrap()
                .contains("Insufficient stock")
        );
    }

    #[tokio::test]
    async fn user_cancellation_releases_reservation() {
        let mut h = Harness::new();
        h.downstream.payment().set_fail_on_charge(true);
        h.publish(created(42, 100)).await;

        // Stop before the payment result arrives
        h.consumer.drain(&mut h.events).await.unwrap();
        h.relay.relay_once().await.unwrap();
        h.downstream.pump(&mut h.commands, &h.bus).await.unwrap();
        h.consumer.drain(&mut h.events).await.unwrap();
        assert_eq!(h.state(42).await, Some(FulfillmentState::AwaitingPayment));

        h.publish(FulfillmentEvent::cancelled_by_user(42u64, "changed mind"))
            .await;
        h.settle().await;

        assert_eq!(h.state(42).await, Some(FulfillmentState::Cancelled));
        assert_eq!(h.downstream.inventory().reservation_count(), 0);
        // The late payment result is acknowledged without effect
        let types = command_types(&h.store, 42).await;
        assert_eq!(count(&types, "ReleaseInventory"), 1);
        assert_eq!(count(&types, "RefundPayment"), 0);
    }

    #[tokio::test]
    async fn captured_amount_mismatch_is_ignored() {
        let mut h = Harness::new();
        h.downstream
            .payment()
            .set_captured_amount(Some(Money::from_major(1)));
        h.publish(created(42, 100)).await;
        h.settle().await;

        assert_eq!(h.state(42).await, Some(FulfillmentState::AwaitingPayment));
        assert_eq!(count(&command_types(&h.store, 42).await, "RequestShipment"), 0);
    }

    #[tokio::test]
    async fn failed_compensation_reaches_operator_queue() {
        let mut h = Harness::new();
        h.downstream.inventory().set_fail_on_release(true);
        h.downstream.payment().set_fail_on_charge(true);
        h.publish(created(42, 100)).await;
        h.settle().await;

        assert_eq!(h.state(42).await, Some(FulfillmentState::Cancelled));
        let queue = h.store.operator_queue(10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, DeadLetterKind::CompensationFailure);
        assert!(queue[0].error.contains("ReleaseInventory"));
    }

    #[tokio::test]
    async fn undeliverable_compensation_is_escalated_by_relay() {
        let h = Harness::with_relay(RelayConfig {
            max_dispatch_attempts: 2,
            ..Default::default()
        });
        to_awaiting_payment(h.engine(), 43).await;
        h.relay.relay_once().await.unwrap();

        // The broker goes away before the unwind is published
        h.bus.set_unavailable(true);
        h.engine()
            .handle(inbound(FulfillmentEvent::payment_failed(43u64, "declined")))
            .await
            .unwrap();

        let first = h.relay.relay_once().await.unwrap();
        assert_eq!((first.failed, first.deferred), (1, 1));
        let second = h.relay.relay_once().await.unwrap();
        assert_eq!((second.abandoned, second.deferred), (1, 1));

        let queue = h.store.operator_queue(10).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].kind, DeadLetterKind::CompensationFailure);
        assert_eq!(queue[0].event_type.as_deref(), Some("ReleaseInventory"));
        assert_eq!(queue[0].correlation_id, Some(BusinessKey::from(43u64)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_services_complete_orders() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryEventBus::new();
        let engine = Arc::new(engine_on(store.clone()));
        let consumer = Arc::new(SagaConsumer::new(Arc::clone(&engine)));
        let relay = Arc::new(OutboxRelay::with_config(
            store.clone(),
            bus.clone(),
            RelayConfig {
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        ));
        let downstream = Arc::new(InMemoryDownstream::in_memory());
        let (tx, rx) = watch::channel(false);

        let subscription = bus.subscribe(EVENTS_TOPIC);
        let command_subscriptions = InMemoryDownstream::subscribe(&bus);
        let mut tasks = Vec::new();
        {
            let consumer = Arc::clone(&consumer);
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move { consumer.run(subscription, rx).await }));
        }
        {
            let relay = Arc::clone(&relay);
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move { relay.run(rx).await }));
        }
        {
            let downstream = Arc::clone(&downstream);
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move {
                downstream.run(command_subscriptions, &bus, rx).await
            }));
        }

        for id in 1..=10u64 {
            bus.publish(BusMessage::event(EVENTS_TOPIC, &created(id, 10)).unwrap())
                .await
                .unwrap();
        }

        let mut completed = 0;
        for _ in 0..300 {
            completed = 0;
            for id in 1..=10u64 {
                if state_of(&engine, id).await == Some(FulfillmentState::Completed) {
                    completed += 1;
                }
            }
            if completed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(completed, 10);
        assert_eq!(downstream.shipping().shipment_count(), 10);
    }
}
