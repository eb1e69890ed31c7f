//! Customer accounts (event-sourced).
//!
//! A small aggregate that other aggregates schedule commands against, e.g. an
//! order asking for a cancellation confirmation email.

pub mod customer_account;

pub use customer_account::{
    ChangeEmailAddress, CustomerAccount, CustomerAccountCommand, CustomerAccountEvent, EmailAddressChanged,
    OrderCancelationConfirmationEmailSent, OrderConfirmationEmailSent, SendOrderCancellationConfirmationEmail,
    SendOrderConfirmationEmail,
};
