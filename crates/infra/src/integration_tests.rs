//! Integration tests for scheduling and delivery end to end.
//!
//! Tests: schedule → pipeline → store → executor → repository → event bus
//!
//! Verifies:
//! - Due commands are delivered while they are scheduled
//! - Commands scheduled by aggregates reach the scheduler through the bus
//! - A failure on one command never affects another
//! - Failed deliveries are retried with quadratic backoff, then given up
//! - Delivery preconditions hold commands back until the event is committed
//! - Renamed events replay under their new type

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Value as JsonValue;

    use chronicle_core::{AggregateId, Clock, DomainError, VirtualClock};
    use chronicle_events::{
        BusError, CommandBody, CommandFailed, DeliveryError, DependencyEvent, EventBus, EventEnvelope, EventHandler,
        EventHandlingError, EventSourced, HandlerId, HistoricalEvent, InMemoryEventBus, PendingEvent,
        ScheduledCommand, Sourced, Subscription,
    };
    use chronicle_parties::{ChangeEmailAddress, CustomerAccount, CustomerAccountCommand, CustomerAccountEvent};
    use chronicle_sales::{
        AddItem, Cancel, CreateOrder, Order, OrderCommand, OrderEvent, Ship, ShipOn,
        cancel_shipment_of_cancelled_order,
    };

    use crate::event_store::InMemoryEventStore;
    use crate::migration::{EventMigrator, MigrationError, Rename};
    use crate::repository::{EventSourcedRepository, EventStoreRepository, RepositoryError, SharedEventBus};
    use crate::scheduling::{
        AuthorizationPolicy, EventStorePreconditionVerifier, Interceptor, Next, PreconditionVerifier,
        SchedulerSettings, SchedulingConfiguration, SchedulingError, interceptor,
    };

    type Store = Arc<InMemoryEventStore>;
    type OrderRepository = EventStoreRepository<Order, Store>;
    type CustomerRepository = EventStoreRepository<CustomerAccount, Store>;

    struct Harness {
        clock: VirtualClock,
        store: Store,
        bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>,
        verifier: Arc<dyn PreconditionVerifier>,
        orders: Arc<OrderRepository>,
        customers: Arc<CustomerRepository>,
        order_config: SchedulingConfiguration<Order>,
        customer_config: SchedulingConfiguration<CustomerAccount>,
    }

    fn start_of_2024() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn settings(name: &str) -> SchedulerSettings {
        SchedulerSettings::default()
            .with_name(name)
            .with_precondition_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10))
    }

    fn order_configuration(
        orders: &Arc<OrderRepository>,
        bus: SharedEventBus,
        clock: &VirtualClock,
        verifier: &Arc<dyn PreconditionVerifier>,
    ) -> SchedulingConfiguration<Order> {
        let mut config =
            SchedulingConfiguration::<Order>::new(orders.clone(), bus, Arc::new(clock.clone()), verifier.clone())
                .with_settings(settings("orders"));
        config.on_scheduled_command_failure("ship", cancel_shipment_of_cancelled_order);
        config
    }

    impl Harness {
        fn new() -> Self {
            chronicle_observability::init_for_tests();

            let clock = VirtualClock::start_at(start_of_2024());
            let store: Store = Arc::new(InMemoryEventStore::new());
            let bus = Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new());
            let shared_bus: SharedEventBus = bus.clone();
            let verifier: Arc<dyn PreconditionVerifier> =
                Arc::new(EventStorePreconditionVerifier::new(store.clone()));

            let orders = Arc::new(OrderRepository::new(store.clone(), shared_bus.clone()));
            let customers = Arc::new(CustomerRepository::new(store.clone(), shared_bus.clone()));

            let order_config = order_configuration(&orders, shared_bus.clone(), &clock, &verifier);
            order_config.subscribe_to_event_bus();

            let customer_config = SchedulingConfiguration::<CustomerAccount>::new(
                customers.clone(),
                shared_bus,
                Arc::new(clock.clone()),
                verifier.clone(),
            )
            .with_settings(settings("customers"));
            customer_config.subscribe_to_event_bus();

            Self {
                clock,
                store,
                bus,
                verifier,
                orders,
                customers,
                order_config,
                customer_config,
            }
        }

        fn shared_bus(&self) -> SharedEventBus {
            self.bus.clone()
        }

        /// A fresh, unsubscribed order configuration sharing this harness's
        /// store, bus and clock.
        fn order_configuration(&self) -> SchedulingConfiguration<Order> {
            order_configuration(&self.orders, self.shared_bus(), &self.clock, &self.verifier)
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        async fn create_customer(&self) -> AggregateId {
            let id = AggregateId::new();
            let mut customer = Sourced::<CustomerAccount>::new(id);
            customer
                .apply_command(&CustomerAccountCommand::ChangeEmailAddress(ChangeEmailAddress {
                    email_address: "customer@example.com".to_string(),
                    occurred_at: self.now(),
                }))
                .unwrap();
            EventSourcedRepository::<CustomerAccount>::save(&*self.customers, &mut customer)
                .await
                .unwrap();
            id
        }

        /// A new order for a new customer.
        async fn create_order(&self) -> (AggregateId, AggregateId) {
            let customer_id = self.create_customer().await;
            let order_id = AggregateId::new();
            let mut order = Sourced::<Order>::new(order_id);
            order
                .apply_command(&OrderCommand::CreateOrder(CreateOrder {
                    customer_id,
                    occurred_at: self.now(),
                }))
                .unwrap();
            EventSourcedRepository::<Order>::save(&*self.orders, &mut order)
                .await
                .unwrap();
            (order_id, customer_id)
        }

        async fn order(&self, id: AggregateId) -> Sourced<Order> {
            EventSourcedRepository::<Order>::get_latest(&*self.orders, id)
                .await
                .unwrap()
                .expect("order exists")
        }

        async fn customer(&self, id: AggregateId) -> Sourced<CustomerAccount> {
            EventSourcedRepository::<CustomerAccount>::get_latest(&*self.customers, id)
                .await
                .unwrap()
                .expect("customer exists")
        }

        async fn apply_to_order(&self, id: AggregateId, command: OrderCommand) {
            let mut order = self.order(id).await;
            order.apply_command(&command).unwrap();
            EventSourcedRepository::<Order>::save(&*self.orders, &mut order)
                .await
                .unwrap();
        }

        async fn latest_order_event(&self, id: AggregateId) -> OrderEvent {
            self.order(id).await.last_event().cloned().expect("order has events")
        }

        async fn wait_for_order_event(&self, id: AggregateId, matches: fn(&OrderEvent) -> bool) -> bool {
            for _ in 0..200 {
                if matches(&self.latest_order_event(id).await) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        }
    }

    /// Creates the aggregate under the caller's feet on the first save.
    struct RacingRepository {
        inner: Arc<OrderRepository>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl EventSourcedRepository<Order> for RacingRepository {
        async fn get_latest(&self, id: AggregateId) -> Result<Option<Sourced<Order>>, RepositoryError> {
            EventSourcedRepository::<Order>::get_latest(&*self.inner, id).await
        }

        async fn save(&self, aggregate: &mut Sourced<Order>) -> Result<(), RepositoryError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut competitor = Sourced::<Order>::new(aggregate.id());
                competitor
                    .apply_command(&OrderCommand::CreateOrder(CreateOrder {
                        customer_id: AggregateId::new(),
                        occurred_at: Utc::now(),
                    }))
                    .unwrap();
                EventSourcedRepository::<Order>::save(&*self.inner, &mut competitor).await?;
            }
            EventSourcedRepository::<Order>::save(&*self.inner, aggregate).await
        }
    }

    /// Refuses every publish.
    #[derive(Default)]
    struct ClosedBus {
        inner: InMemoryEventBus<EventEnvelope<JsonValue>>,
    }

    #[async_trait]
    impl EventBus<EventEnvelope<JsonValue>> for ClosedBus {
        async fn publish(&self, _message: EventEnvelope<JsonValue>) -> Result<(), BusError> {
            Err(BusError::Closed)
        }

        fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
            self.inner.subscribe()
        }

        fn register(&self, handler: Arc<dyn EventHandler<EventEnvelope<JsonValue>>>) -> HandlerId {
            self.inner.register(handler)
        }

        fn unregister(&self, id: HandlerId) -> bool {
            self.inner.unregister(id)
        }

        fn publish_error(&self, error: EventHandlingError) {
            self.inner.publish_error(error)
        }

        fn errors(&self) -> Subscription<EventHandlingError> {
            self.inner.errors()
        }
    }

    fn ship(at: DateTime<Utc>) -> CommandBody<OrderCommand> {
        CommandBody::Ordinary(OrderCommand::Ship(Ship { occurred_at: at }))
    }

    fn ship_on(ship_date: DateTime<Utc>) -> OrderCommand {
        OrderCommand::ShipOn(ShipOn {
            ship_date,
            occurred_at: ship_date,
        })
    }

    fn cancel(at: DateTime<Utc>) -> OrderCommand {
        OrderCommand::Cancel(Cancel { occurred_at: at })
    }

    fn is_shipped(event: &OrderEvent) -> bool {
        matches!(event, OrderEvent::Shipped(_))
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &'static str, log: Log) -> Box<dyn Interceptor<OrderCommand>> {
        Box::new(interceptor(move |cmd, next: Next<OrderCommand>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}-pre"));
                let result = next.run(cmd).await;
                log.lock().unwrap().push(format!("{name}-post"));
                result
            }
        }))
    }

    #[tokio::test]
    async fn ship_due_yesterday_is_delivered_while_scheduling() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let yesterday = h.now() - chrono::Duration::days(1);
        let scheduled = scheduler
            .schedule(order_id, ship(h.now()), Some(yesterday), None)
            .await
            .unwrap();

        assert!(scheduled.succeeded());
        assert!(is_shipped(&h.latest_order_event(order_id).await));
    }

    #[tokio::test]
    async fn command_without_due_time_is_delivered_immediately() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let scheduled = scheduler.schedule(order_id, ship(h.now()), None, None).await.unwrap();

        assert!(scheduled.succeeded());
        assert!(is_shipped(&h.latest_order_event(order_id).await));
        assert_eq!(scheduler.store().get(scheduled.etag()).unwrap(), Some(scheduled));
    }

    #[tokio::test]
    async fn delivering_a_completed_command_again_changes_nothing() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let delivered = scheduler.schedule(order_id, ship(h.now()), None, None).await.unwrap();
        let version = h.order(order_id).await.version();

        let again = scheduler.deliver(delivered.clone()).await.unwrap();

        assert_eq!(again, delivered);
        assert_eq!(h.order(order_id).await.version(), version);
    }

    #[tokio::test]
    async fn order_cancelled_before_ship_date_ends_with_shipment_cancelled() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;

        let ship_date = h.now() + chrono::Duration::days(30);
        h.apply_to_order(order_id, ship_on(ship_date)).await;
        assert_eq!(h.order_config.store().pending().unwrap().len(), 1);

        h.apply_to_order(order_id, cancel(h.now())).await;
        h.clock.advance_by(chrono::Duration::days(32));

        let report = h.order_config.command_scheduler().deliver_due().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            h.latest_order_event(order_id).await,
            OrderEvent::ShipmentCancelled(_)
        ));
        assert!(h.order_config.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_order_failing_to_ship_does_not_affect_another() {
        let h = Harness::new();
        let (cancelled_id, _) = h.create_order().await;
        let (shipped_id, _) = h.create_order().await;

        let ship_date = h.now() + chrono::Duration::days(30);
        h.apply_to_order(cancelled_id, ship_on(ship_date)).await;
        h.apply_to_order(shipped_id, ship_on(ship_date)).await;
        h.apply_to_order(cancelled_id, cancel(h.now())).await;

        h.clock.advance_by(chrono::Duration::days(32));
        let report = h.order_config.command_scheduler().deliver_due().await.unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            h.latest_order_event(cancelled_id).await,
            OrderEvent::ShipmentCancelled(_)
        ));
        assert!(is_shipped(&h.latest_order_event(shipped_id).await));
    }

    #[tokio::test]
    async fn cancelling_an_order_confirms_the_cancellation_to_the_customer() {
        let h = Harness::new();
        let (order_id, customer_id) = h.create_order().await;

        h.apply_to_order(order_id, cancel(h.now())).await;

        let customer = h.customer(customer_id).await;
        match customer.last_event() {
            Some(CustomerAccountEvent::OrderCancelationConfirmationEmailSent(e)) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.email_address, "customer@example.com");
            }
            other => panic!("Expected OrderCancelationConfirmationEmailSent, got {other:?}"),
        }
        assert!(h.customer_config.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_aggregate_id_is_rejected() {
        let h = Harness::new();
        let scheduler = h.order_config.command_scheduler();

        let err = scheduler
            .schedule(AggregateId::nil(), ship(h.now()), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulingError::Argument(ref msg) if msg.contains("aggregate_id cannot be empty")));
    }

    #[tokio::test]
    async fn dependency_without_aggregate_id_is_rejected() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let mut dependency = PendingEvent::new(
            AggregateId::nil(),
            CustomerAccountEvent::EmailAddressChanged(chronicle_parties::EmailAddressChanged {
                email_address: "customer@example.com".to_string(),
                occurred_at: h.now(),
            }),
        );
        let err = scheduler
            .schedule(order_id, ship(h.now()), None, Some(&mut dependency as &mut dyn DependencyEvent))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("AggregateId must be set"));
        assert!(scheduler.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dependency_without_etag_gets_one_assigned() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let mut dependency = PendingEvent::new(
            AggregateId::new(),
            CustomerAccountEvent::EmailAddressChanged(chronicle_parties::EmailAddressChanged {
                email_address: "customer@example.com".to_string(),
                occurred_at: h.now(),
            }),
        );
        assert!(dependency.etag().is_none());

        let due = h.now() + chrono::Duration::days(1);
        let scheduled = scheduler
            .schedule(order_id, ship(h.now()), Some(due), Some(&mut dependency as &mut dyn DependencyEvent))
            .await
            .unwrap();

        let etag = dependency.etag().cloned().expect("etag assigned");
        let precondition = scheduled.delivery_precondition().expect("precondition set");
        assert_eq!(precondition.etag, etag);
        assert_eq!(precondition.aggregate_id, dependency.aggregate_id());
        assert!(scheduled.is_pending());
    }

    #[tokio::test]
    async fn later_registered_interceptors_wrap_earlier_ones() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let log: Log = Arc::default();

        let mut config = h.order_configuration();
        config.add_to_command_scheduler_pipeline(Some(recording("x", log.clone())), None);
        config.add_to_command_scheduler_pipeline(Some(recording("y", log.clone())), None);
        let scheduler = config.command_scheduler();

        config.add_to_command_scheduler_pipeline(Some(recording("z", log.clone())), None);

        scheduler.schedule(order_id, ship(h.now()), None, None).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["y-pre", "x-pre", "x-post", "y-post"]);

        log.lock().unwrap().clear();
        let (second_order, _) = h.create_order().await;
        config
            .command_scheduler()
            .schedule(second_order, ship(h.now()), None, None)
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["z-pre", "y-pre", "x-pre", "x-post", "y-post", "z-post"]
        );
    }

    #[tokio::test]
    async fn deliver_interceptor_can_hold_a_command_back() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;

        let mut config = h.order_configuration();
        config.add_to_command_scheduler_pipeline(
            None,
            Some(Box::new(interceptor(|cmd, _next: Next<OrderCommand>| async move { Ok(cmd) }))
                as Box<dyn Interceptor<OrderCommand>>),
        );
        let scheduler = config.command_scheduler();

        let scheduled = scheduler.schedule(order_id, ship(h.now()), None, None).await.unwrap();

        assert!(scheduled.is_pending());
        assert!(matches!(h.latest_order_event(order_id).await, OrderEvent::Created(_)));
        // Released, so a later delivery can claim it.
        assert!(scheduler.store().claim(scheduled.etag()).unwrap().is_some());
    }

    #[tokio::test]
    async fn command_waits_for_the_event_it_depends_on() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let mut customer = Sourced::<CustomerAccount>::new(AggregateId::new());
        customer
            .apply_command(&CustomerAccountCommand::ChangeEmailAddress(ChangeEmailAddress {
                email_address: "late@example.com".to_string(),
                occurred_at: h.now(),
            }))
            .unwrap();

        let scheduled = scheduler
            .schedule(
                order_id,
                ship(h.now()),
                None,
                Some(&mut customer.pending_events_mut()[0] as &mut dyn DependencyEvent),
            )
            .await
            .unwrap();
        assert!(scheduled.is_pending());
        assert!(matches!(h.latest_order_event(order_id).await, OrderEvent::Created(_)));

        EventSourcedRepository::<CustomerAccount>::save(&*h.customers, &mut customer)
            .await
            .unwrap();

        assert!(h.wait_for_order_event(order_id, is_shipped).await);
        let stored = scheduler.store().get(scheduled.etag()).unwrap().unwrap();
        assert!(stored.succeeded());
    }

    #[tokio::test]
    async fn unsatisfied_precondition_times_out_with_an_error_on_the_bus() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();
        let mut errors = h.bus.errors();

        let mut never_saved = PendingEvent::new(
            AggregateId::new(),
            CustomerAccountEvent::EmailAddressChanged(chronicle_parties::EmailAddressChanged {
                email_address: "never@example.com".to_string(),
                occurred_at: h.now(),
            }),
        );
        let scheduled = scheduler
            .schedule(order_id, ship(h.now()), None, Some(&mut never_saved as &mut dyn DependencyEvent))
            .await
            .unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("timeout error published")
            .expect("error stream open");

        assert_eq!(error.handler, "orders");
        assert_eq!(error.aggregate_id, Some(order_id));
        assert!(error.message.contains(scheduled.etag().as_str()));

        let stored = scheduler.store().get(scheduled.etag()).unwrap().unwrap();
        assert!(stored.is_pending());
        assert!(matches!(h.latest_order_event(order_id).await, OrderEvent::Created(_)));
    }

    #[tokio::test]
    async fn poller_delivers_commands_once_the_clock_reaches_them() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;

        h.apply_to_order(order_id, ship_on(h.now() + chrono::Duration::days(1))).await;
        let poller = h.order_config.spawn_poller();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            h.latest_order_event(order_id).await,
            OrderEvent::CommandScheduled(_)
        ));

        h.clock.advance_by(chrono::Duration::days(2));
        assert!(h.wait_for_order_event(order_id, is_shipped).await);

        let stats = poller.stats();
        poller.shutdown().await;
        assert!(stats.polls > 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_with_quadratic_backoff_then_given_up() {
        let h = Harness::new();
        let scheduler = h.order_config.command_scheduler();
        let missing = AggregateId::new();

        let first = scheduler.schedule(missing, ship(h.now()), None, None).await.unwrap();
        let failure = first.failure().expect("delivery failed");
        assert!(matches!(failure.error(), DeliveryError::Concurrency(msg)
            if msg == &format!("No sales.order was found with id {missing} so the command could not be applied.")));
        assert_eq!(failure.retry_after(), Some(Duration::from_secs(60)));

        let etag = first.etag().clone();
        let mut wait_minutes = 1;
        for (attempts, next_wait) in [(1u32, 4i64), (2, 9), (3, 16), (4, 25)] {
            let pending = scheduler.store().get(&etag).unwrap().unwrap();
            assert!(pending.is_pending());
            assert_eq!(pending.number_of_previous_attempts(), attempts);
            assert_eq!(pending.due_time(), Some(h.now() + chrono::Duration::minutes(wait_minutes)));

            h.clock.advance_by(chrono::Duration::minutes(wait_minutes));
            let report = scheduler.deliver_due().await.unwrap();
            assert_eq!(report.failed, 1);
            wait_minutes = next_wait;
        }

        let pending = scheduler.store().get(&etag).unwrap().unwrap();
        assert_eq!(pending.number_of_previous_attempts(), 5);
        h.clock.advance_by(chrono::Duration::minutes(25));
        scheduler.deliver_due().await.unwrap();

        let last = scheduler.store().get(&etag).unwrap().unwrap();
        let failure = last.failure().expect("gave up");
        assert_eq!(failure.number_of_previous_attempts(), 6);
        assert!(!failure.will_be_retried());
        assert!(scheduler.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn construction_conflict_cancels_the_command() {
        let h = Harness::new();
        let racing = Arc::new(RacingRepository {
            inner: h.orders.clone(),
            raced: AtomicBool::new(false),
        });
        let config = SchedulingConfiguration::<Order>::new(
            racing,
            h.shared_bus(),
            Arc::new(h.clock.clone()),
            h.verifier.clone(),
        )
        .with_settings(settings("orders"));
        let scheduler = config.command_scheduler();

        let order_id = AggregateId::new();
        let create = CommandBody::Construction(OrderCommand::CreateOrder(CreateOrder {
            customer_id: AggregateId::new(),
            occurred_at: h.now(),
        }));
        let scheduled = scheduler.schedule(order_id, create, None, None).await.unwrap();

        let failure = scheduled.failure().expect("construction lost the race");
        assert!(failure.error().is_concurrency());
        assert!(failure.is_canceled());
        assert_eq!(failure.retry_after(), None);
        assert!(scheduler.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn construction_command_creates_a_missing_aggregate() {
        let h = Harness::new();
        let scheduler = h.order_config.command_scheduler();
        let order_id = AggregateId::new();

        let create = CommandBody::Construction(OrderCommand::CreateOrder(CreateOrder {
            customer_id: AggregateId::new(),
            occurred_at: h.now(),
        }));
        let scheduled = scheduler.schedule(order_id, create, None, None).await.unwrap();

        assert!(scheduled.succeeded());
        assert!(matches!(h.latest_order_event(order_id).await, OrderEvent::Created(_)));
    }

    #[tokio::test]
    async fn denied_commands_fail_as_unauthorized() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let config = h
            .order_configuration()
            .with_authorization(AuthorizationPolicy::predicate(|_order: &Sourced<Order>, command: &OrderCommand| {
                !matches!(command, OrderCommand::Ship(_))
            }));

        let scheduled = config
            .command_scheduler()
            .schedule(order_id, ship(h.now()), None, None)
            .await
            .unwrap();

        let failure = scheduled.failure().expect("delivery denied");
        assert_eq!(failure.error(), &DeliveryError::Domain(DomainError::Unauthorized));
        assert!(matches!(h.latest_order_event(order_id).await, OrderEvent::Created(_)));
    }

    async fn order_with_item(h: &Harness) -> AggregateId {
        let (order_id, _) = h.create_order().await;
        h.apply_to_order(
            order_id,
            OrderCommand::AddItem(AddItem {
                product_name: "widget".to_string(),
                quantity: 3,
                price: 250,
                occurred_at: h.now(),
            }),
        )
        .await;
        order_id
    }

    #[tokio::test]
    async fn renamed_event_replays_as_its_new_type() {
        let h = Harness::new();
        let order_id = order_with_item(&h).await;
        let mut order = h.order(order_id).await;

        EventMigrator::save_with_renames(&*h.orders, &mut order, &[Rename::new(2, "sales.order.item_added.v2")])
            .await
            .unwrap();

        let reloaded = h.order(order_id).await;
        match &reloaded.history()[1].event {
            HistoricalEvent::Typed(OrderEvent::ItemAdded2(item)) => {
                assert_eq!(item.product_name, "widget");
                assert_eq!(item.quantity, 3);
            }
            other => panic!("Expected ItemAdded2, got {other:?}"),
        }
        assert_eq!(reloaded.state().items().len(), 1);
    }

    #[tokio::test]
    async fn renaming_to_an_unknown_type_leaves_an_anonymous_placeholder() {
        let h = Harness::new();
        let order_id = order_with_item(&h).await;
        let mut order = h.order(order_id).await;
        order.apply_command(&cancel(h.now())).unwrap();

        EventMigrator::save_with_renames(&*h.orders, &mut order, &[Rename::new(2, "sales.order.item_added.legacy")])
            .await
            .unwrap();

        let reloaded = h.order(order_id).await;
        let placeholder = &reloaded.history()[1];
        assert_eq!(placeholder.sequence_number, 2);
        match &placeholder.event {
            HistoricalEvent::Anonymous(anonymous) => {
                assert_eq!(anonymous.event_type, "sales.order.item_added.legacy");
                assert_eq!(anonymous.payload["product_name"], "widget");
            }
            other => panic!("Expected an anonymous event, got {other:?}"),
        }
        assert!(reloaded.state().items().is_empty());
        assert!(matches!(
            reloaded.history()[2].event,
            HistoricalEvent::Typed(OrderEvent::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn renaming_a_missing_sequence_number_fails_and_changes_nothing() {
        let h = Harness::new();
        let order_id = order_with_item(&h).await;
        let mut order = h.order(order_id).await;
        order.apply_command(&cancel(h.now())).unwrap();
        let stored_before = h.store.len();

        let err = EventMigrator::save_with_renames(
            &*h.orders,
            &mut order,
            &[Rename::new(2, "sales.order.item_added.v2"), Rename::new(99999, "sales.order.item_added.v2")],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MigrationError::SequenceNumberNotFound { sequence_number: 99999, .. }));
        assert!(err.to_string().starts_with(&format!(
            "Migration failed, because no event with sequence number 99999 on aggregate {order_id}"
        )));
        assert_eq!(h.store.len(), stored_before);
        assert!(matches!(
            h.order(order_id).await.history()[1].event,
            HistoricalEvent::Typed(OrderEvent::ItemAdded(_))
        ));
    }

    #[tokio::test]
    async fn scheduled_events_for_other_aggregates_are_ignored_by_each_scheduler() {
        let h = Harness::new();
        let (order_id, customer_id) = h.create_order().await;

        h.apply_to_order(order_id, ship_on(h.now() + chrono::Duration::days(3))).await;

        assert_eq!(h.order_config.store().pending().unwrap().len(), 1);
        assert!(h.customer_config.store().pending().unwrap().is_empty());
        assert_eq!(h.customer(customer_id).await.version(), 1);
    }

    #[tokio::test]
    async fn interceptors_registered_after_subscribing_see_bus_scheduled_commands() {
        let mut h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let log: Log = Arc::default();

        h.order_config
            .add_to_command_scheduler_pipeline(Some(recording("schedule", log.clone())), Some(recording("deliver", log.clone())));
        h.apply_to_order(order_id, ship_on(h.now() - chrono::Duration::days(1))).await;

        assert!(is_shipped(&h.latest_order_event(order_id).await));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["schedule-pre", "deliver-pre", "deliver-post", "schedule-post"]
        );
    }

    #[tokio::test]
    async fn poller_runs_interceptors_registered_after_it_started() {
        let mut h = Harness::new();
        let (order_id, _) = h.create_order().await;
        h.apply_to_order(order_id, ship_on(h.now() + chrono::Duration::days(1))).await;
        let poller = h.order_config.spawn_poller();

        let log: Log = Arc::default();
        h.order_config
            .add_to_command_scheduler_pipeline(None, Some(recording("late", log.clone())));
        h.clock.advance_by(chrono::Duration::days(2));

        assert!(h.wait_for_order_event(order_id, is_shipped).await);
        poller.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec!["late-pre", "late-post"]);
    }

    #[tokio::test]
    async fn command_depending_on_a_committed_event_is_delivered_while_scheduling() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let scheduler = h.order_config.command_scheduler();

        let mut published = h.bus.subscribe();
        let customer_id = h.create_customer().await;
        let mut committed = published.recv().await.expect("customer event published");
        assert_eq!(committed.aggregate_id(), customer_id);
        assert!(committed.etag().is_some());

        let scheduled = scheduler
            .schedule(order_id, ship(h.now()), None, Some(&mut committed as &mut dyn DependencyEvent))
            .await
            .unwrap();

        assert!(scheduled.succeeded());
        assert!(is_shipped(&h.latest_order_event(order_id).await));
    }

    #[tokio::test]
    async fn retry_delay_chosen_by_a_failure_handler_is_kept() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        h.apply_to_order(order_id, cancel(h.now())).await;

        let mut config = h.order_configuration();
        config.on_scheduled_command_failure(
            "ship",
            |_order: &mut Sourced<Order>, _command: &OrderCommand, failure: &mut CommandFailed| {
                failure.retry(Duration::from_secs(10 * 60));
            },
        );

        let scheduled = config
            .command_scheduler()
            .schedule(order_id, ship(h.now()), None, None)
            .await
            .unwrap();

        let failure = scheduled.failure().expect("shipping a cancelled order fails");
        assert_eq!(failure.retry_after(), Some(Duration::from_secs(10 * 60)));
        let next = config.store().get(scheduled.etag()).unwrap().unwrap();
        assert!(next.is_pending());
        assert_eq!(next.number_of_previous_attempts(), 1);
        assert_eq!(next.due_time(), Some(h.now() + chrono::Duration::minutes(10)));
    }

    #[tokio::test]
    async fn handling_the_same_scheduled_event_twice_delivers_once() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let mut published = h.bus.subscribe();

        h.apply_to_order(order_id, ship_on(h.now() - chrono::Duration::days(1))).await;
        let scheduled_event = published.recv().await.expect("command scheduled event published");
        assert_eq!(scheduled_event.event_type(), Order::COMMAND_SCHEDULED_EVENT);
        let scheduled: ScheduledCommand<OrderCommand> =
            serde_json::from_value(scheduled_event.payload().clone()).unwrap();
        let version = h.order(order_id).await.version();

        h.bus.publish(scheduled_event).await.unwrap();

        assert_eq!(h.order(order_id).await.version(), version);
        let stored = h.order_config.store().get(scheduled.etag()).unwrap().unwrap();
        assert!(stored.succeeded());
        assert!(h.order_config.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_publish_after_commit_does_not_fail_the_delivery() {
        let h = Harness::new();
        let (order_id, _) = h.create_order().await;
        let closed: SharedEventBus = Arc::new(ClosedBus::default());
        let orders = Arc::new(OrderRepository::new(h.store.clone(), closed.clone()));
        let config =
            SchedulingConfiguration::<Order>::new(orders, closed, Arc::new(h.clock.clone()), h.verifier.clone())
                .with_settings(settings("orders"));

        let scheduled = config
            .command_scheduler()
            .schedule(order_id, ship(h.now()), None, None)
            .await
            .unwrap();

        assert!(scheduled.succeeded());
        assert!(is_shipped(&h.latest_order_event(order_id).await));
        assert!(config.store().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_scheduled_command_is_reported_with_the_event() {
        let h = Harness::new();
        let mut errors = h.bus.errors();
        let order_id = AggregateId::new();

        let envelope = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            order_id,
            Order::AGGREGATE_TYPE,
            7,
            Order::COMMAND_SCHEDULED_EVENT,
            serde_json::json!({ "not": "a command" }),
        );
        h.bus.publish(envelope).await.unwrap();

        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("error published")
            .expect("error stream open");

        assert_eq!(error.handler, format!("orders:{}", Order::AGGREGATE_TYPE));
        assert_eq!(error.aggregate_id, Some(order_id));
        assert!(error.message.starts_with("malformed scheduled command"));
        let event = error.undeserializable.expect("event attached");
        assert_eq!(event.stream_name, "sales.order");
        assert_eq!(event.event_type, Order::COMMAND_SCHEDULED_EVENT);
        assert_eq!(event.sequence_number, 7);
        assert_eq!(event.body, r#"{"not":"a command"}"#);
    }
}
