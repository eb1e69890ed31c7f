use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use chronicle_events::{
    Command, CommandBody, CommandFailed, Event, EventSchema, EventSourced, ScheduledCommand, Sourced,
};
use chronicle_parties::{CustomerAccountCommand, SendOrderCancellationConfirmationEmail};

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Shipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_name: String,
    pub quantity: u32,
    /// Price in smallest currency unit (e.g., cents).
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub recipient: String,
    pub address: String,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: AggregateId,
    customer_id: Option<AggregateId>,
    status: OrderStatus,
    items: Vec<OrderItem>,
    shipping_info: Option<ShippingInfo>,
    shipment_cancelled: bool,
    version: u64,
    created: bool,
}

impl Order {
    pub fn customer_id(&self) -> Option<AggregateId> {
        self.customer_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn shipping_info(&self) -> Option<&ShippingInfo> {
        self.shipping_info.as_ref()
    }

    pub fn is_shipment_cancelled(&self) -> bool {
        self.shipment_cancelled
    }

    pub fn is_open(&self) -> bool {
        self.created && self.status == OrderStatus::Open
    }
}

impl AggregateRoot for Order {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub customer_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub product_name: String,
    pub quantity: u32,
    pub price: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SpecifyShippingInfo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecifyShippingInfo {
    pub recipient: String,
    pub address: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShipOn. Schedules a `Ship` for `ship_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipOn {
    pub ship_date: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Ship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ship {
    pub occurred_at: DateTime<Utc>,
}

/// Command: Cancel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    AddItem(AddItem),
    SpecifyShippingInfo(SpecifyShippingInfo),
    ShipOn(ShipOn),
    Ship(Ship),
    Cancel(Cancel),
}

impl Command for OrderCommand {
    fn command_name(&self) -> &'static str {
        match self {
            OrderCommand::CreateOrder(_) => "create_order",
            OrderCommand::AddItem(_) => "add_item",
            OrderCommand::SpecifyShippingInfo(_) => "specify_shipping_info",
            OrderCommand::ShipOn(_) => "ship_on",
            OrderCommand::Ship(_) => "ship",
            OrderCommand::Cancel(_) => "cancel",
        }
    }
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub customer_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ItemAdded. Also the payload of the newer `ItemAdded2` type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub product_name: String,
    pub quantity: u32,
    pub price: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ShippingInfoSpecified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingInfoSpecified {
    pub recipient: String,
    pub address: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipped {
    pub occurred_at: DateTime<Utc>,
}

/// Event: Cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancelled {
    pub occurred_at: DateTime<Utc>,
}

/// Event: ShipmentCancelled. Recorded when a scheduled shipment finds the
/// order already cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentCancelled {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    #[serde(rename = "sales.order.created")]
    Created(OrderCreated),
    #[serde(rename = "sales.order.item_added")]
    ItemAdded(ItemAdded),
    #[serde(rename = "sales.order.item_added.v2")]
    ItemAdded2(ItemAdded),
    #[serde(rename = "sales.order.shipping_info_specified")]
    ShippingInfoSpecified(ShippingInfoSpecified),
    #[serde(rename = "sales.order.shipped")]
    Shipped(Shipped),
    #[serde(rename = "sales.order.cancelled")]
    Cancelled(Cancelled),
    #[serde(rename = "sales.order.shipment_cancelled")]
    ShipmentCancelled(ShipmentCancelled),
    #[serde(rename = "sales.order.command_scheduled")]
    CommandScheduled(ScheduledCommand<OrderCommand>),
    /// Must match `CustomerAccount::COMMAND_SCHEDULED_EVENT`.
    #[serde(rename = "parties.customer_account.command_scheduled")]
    CustomerCommandScheduled(ScheduledCommand<CustomerAccountCommand>),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => "sales.order.created",
            OrderEvent::ItemAdded(_) => "sales.order.item_added",
            OrderEvent::ItemAdded2(_) => "sales.order.item_added.v2",
            OrderEvent::ShippingInfoSpecified(_) => "sales.order.shipping_info_specified",
            OrderEvent::Shipped(_) => "sales.order.shipped",
            OrderEvent::Cancelled(_) => "sales.order.cancelled",
            OrderEvent::ShipmentCancelled(_) => "sales.order.shipment_cancelled",
            OrderEvent::CommandScheduled(_) => "sales.order.command_scheduled",
            OrderEvent::CustomerCommandScheduled(_) => "parties.customer_account.command_scheduled",
        }
    }

    fn version(&self) -> u32 {
        match self {
            OrderEvent::ItemAdded2(_) => 2,
            _ => 1,
        }
    }

    /// Scheduling events have no business time of their own; the due time
    /// (or the epoch for "now") stands in.
    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Created(e) => e.occurred_at,
            OrderEvent::ItemAdded(e) | OrderEvent::ItemAdded2(e) => e.occurred_at,
            OrderEvent::ShippingInfoSpecified(e) => e.occurred_at,
            OrderEvent::Shipped(e) => e.occurred_at,
            OrderEvent::Cancelled(e) => e.occurred_at,
            OrderEvent::ShipmentCancelled(e) => e.occurred_at,
            OrderEvent::CommandScheduled(s) => s.due_time().unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            OrderEvent::CustomerCommandScheduled(s) => s.due_time().unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        }
    }
}

impl EventSchema for OrderEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "sales.order.created",
        "sales.order.item_added",
        "sales.order.item_added.v2",
        "sales.order.shipping_info_specified",
        "sales.order.shipped",
        "sales.order.cancelled",
        "sales.order.shipment_cancelled",
        "sales.order.command_scheduled",
        "parties.customer_account.command_scheduled",
    ];
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created(e) => {
                self.customer_id = Some(e.customer_id);
                self.status = OrderStatus::Open;
                self.created = true;
            }
            OrderEvent::ItemAdded(e) | OrderEvent::ItemAdded2(e) => {
                self.items.push(OrderItem {
                    product_name: e.product_name.clone(),
                    quantity: e.quantity,
                    price: e.price,
                });
            }
            OrderEvent::ShippingInfoSpecified(e) => {
                self.shipping_info = Some(ShippingInfo {
                    recipient: e.recipient.clone(),
                    address: e.address.clone(),
                });
            }
            OrderEvent::Shipped(_) => {
                self.status = OrderStatus::Shipped;
            }
            OrderEvent::Cancelled(_) => {
                self.status = OrderStatus::Cancelled;
            }
            OrderEvent::ShipmentCancelled(_) => {
                self.shipment_cancelled = true;
            }
            // Handed to the scheduler when saved; no state of their own.
            OrderEvent::CommandScheduled(_) | OrderEvent::CustomerCommandScheduled(_) => {}
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::AddItem(cmd) => self.handle_add_item(cmd),
            OrderCommand::SpecifyShippingInfo(cmd) => self.handle_specify_shipping_info(cmd),
            OrderCommand::ShipOn(cmd) => self.handle_ship_on(cmd),
            OrderCommand::Ship(cmd) => self.handle_ship(cmd),
            OrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl EventSourced for Order {
    const AGGREGATE_TYPE: &'static str = "sales.order";
    const COMMAND_SCHEDULED_EVENT: &'static str = "sales.order.command_scheduled";

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            customer_id: None,
            status: OrderStatus::Open,
            items: Vec::new(),
            shipping_info: None,
            shipment_cancelled: false,
            version: 0,
            created: false,
        }
    }
}

impl Order {
    fn ensure_open(&self, action: &str) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        match self.status {
            OrderStatus::Open => Ok(()),
            OrderStatus::Shipped => Err(DomainError::invariant(format!("cannot {action} a shipped order"))),
            OrderStatus::Cancelled => Err(DomainError::invariant(format!("cannot {action} a cancelled order"))),
        }
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        if cmd.customer_id.is_nil() {
            return Err(DomainError::validation("customer_id cannot be empty"));
        }

        Ok(vec![OrderEvent::Created(OrderCreated {
            customer_id: cmd.customer_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_open("modify")?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.product_name.trim().is_empty() {
            return Err(DomainError::validation("product_name cannot be empty"));
        }

        Ok(vec![OrderEvent::ItemAdded(ItemAdded {
            product_name: cmd.product_name.clone(),
            quantity: cmd.quantity,
            price: cmd.price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_specify_shipping_info(&self, cmd: &SpecifyShippingInfo) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_open("modify")?;

        if cmd.address.trim().is_empty() {
            return Err(DomainError::validation("address cannot be empty"));
        }

        Ok(vec![OrderEvent::ShippingInfoSpecified(ShippingInfoSpecified {
            recipient: cmd.recipient.clone(),
            address: cmd.address.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_ship_on(&self, cmd: &ShipOn) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_open("ship")?;

        let ship = OrderCommand::Ship(Ship {
            occurred_at: cmd.ship_date,
        });
        Ok(vec![OrderEvent::CommandScheduled(
            ScheduledCommand::new(self.id, CommandBody::Ordinary(ship)).due_at(cmd.ship_date),
        )])
    }

    fn handle_ship(&self, cmd: &Ship) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_open("ship")?;

        Ok(vec![OrderEvent::Shipped(Shipped {
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &Cancel) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_open("cancel")?;

        let mut events = vec![OrderEvent::Cancelled(Cancelled {
            occurred_at: cmd.occurred_at,
        })];

        if let Some(customer_id) = self.customer_id {
            let confirmation =
                CustomerAccountCommand::SendOrderCancellationConfirmationEmail(SendOrderCancellationConfirmationEmail {
                    order_id: self.id,
                    occurred_at: cmd.occurred_at,
                });
            events.push(OrderEvent::CustomerCommandScheduled(ScheduledCommand::new(
                customer_id,
                CommandBody::Ordinary(confirmation),
            )));
        }

        Ok(events)
    }
}

/// Failure handler for `ship`: a shipment that finds the order cancelled is
/// recorded as `ShipmentCancelled` and never retried.
pub fn cancel_shipment_of_cancelled_order(order: &mut Sourced<Order>, command: &OrderCommand, failure: &mut CommandFailed) {
    if order.state().status() != OrderStatus::Cancelled {
        return;
    }
    let occurred_at = match command {
        OrderCommand::Ship(ship) => ship.occurred_at,
        _ => return,
    };

    order.record(OrderEvent::ShipmentCancelled(ShipmentCancelled { occurred_at }));
    failure.cancel();
}
