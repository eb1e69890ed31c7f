//! Sales orders (event-sourced).
//!
//! Orders schedule their own shipment and schedule confirmation emails on the
//! customer's account; both travel as `CommandScheduled` events.

pub mod order;

pub use order::{
    AddItem, Cancel, Cancelled, CreateOrder, ItemAdded, Order, OrderCommand, OrderCreated, OrderEvent, OrderItem,
    OrderStatus, Ship, ShipOn, ShipmentCancelled, Shipped, ShippingInfo, ShippingInfoSpecified, SpecifyShippingInfo,
    cancel_shipment_of_cancelled_order,
};
