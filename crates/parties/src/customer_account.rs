use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use chronicle_events::{Command, Event, EventSchema, EventSourced};

/// Aggregate root: CustomerAccount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerAccount {
    id: AggregateId,
    email_address: Option<String>,
    order_confirmations_sent: u32,
    cancelation_confirmations_sent: u32,
    version: u64,
}

impl CustomerAccount {
    pub fn email_address(&self) -> Option<&str> {
        self.email_address.as_deref()
    }

    /// An account exists once it has an email address.
    pub fn exists(&self) -> bool {
        self.email_address.is_some()
    }

    pub fn order_confirmations_sent(&self) -> u32 {
        self.order_confirmations_sent
    }

    pub fn cancelation_confirmations_sent(&self) -> u32 {
        self.cancelation_confirmations_sent
    }
}

impl AggregateRoot for CustomerAccount {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ChangeEmailAddress. Also opens the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEmailAddress {
    pub email_address: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SendOrderConfirmationEmail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOrderConfirmationEmail {
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SendOrderCancellationConfirmationEmail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOrderCancellationConfirmationEmail {
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomerAccountCommand {
    ChangeEmailAddress(ChangeEmailAddress),
    SendOrderConfirmationEmail(SendOrderConfirmationEmail),
    SendOrderCancellationConfirmationEmail(SendOrderCancellationConfirmationEmail),
}

impl Command for CustomerAccountCommand {
    fn command_name(&self) -> &'static str {
        match self {
            CustomerAccountCommand::ChangeEmailAddress(_) => "change_email_address",
            CustomerAccountCommand::SendOrderConfirmationEmail(_) => "send_order_confirmation_email",
            CustomerAccountCommand::SendOrderCancellationConfirmationEmail(_) => {
                "send_order_cancellation_confirmation_email"
            }
        }
    }
}

/// Event: EmailAddressChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddressChanged {
    pub email_address: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmationEmailSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmationEmailSent {
    pub order_id: AggregateId,
    pub email_address: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelationConfirmationEmailSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelationConfirmationEmailSent {
    pub order_id: AggregateId,
    pub email_address: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CustomerAccountEvent {
    #[serde(rename = "parties.customer_account.email_address_changed")]
    EmailAddressChanged(EmailAddressChanged),
    #[serde(rename = "parties.customer_account.order_confirmation_email_sent")]
    OrderConfirmationEmailSent(OrderConfirmationEmailSent),
    #[serde(rename = "parties.customer_account.order_cancelation_confirmation_email_sent")]
    OrderCancelationConfirmationEmailSent(OrderCancelationConfirmationEmailSent),
}

impl Event for CustomerAccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CustomerAccountEvent::EmailAddressChanged(_) => "parties.customer_account.email_address_changed",
            CustomerAccountEvent::OrderConfirmationEmailSent(_) => {
                "parties.customer_account.order_confirmation_email_sent"
            }
            CustomerAccountEvent::OrderCancelationConfirmationEmailSent(_) => {
                "parties.customer_account.order_cancelation_confirmation_email_sent"
            }
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CustomerAccountEvent::EmailAddressChanged(e) => e.occurred_at,
            CustomerAccountEvent::OrderConfirmationEmailSent(e) => e.occurred_at,
            CustomerAccountEvent::OrderCancelationConfirmationEmailSent(e) => e.occurred_at,
        }
    }
}

impl EventSchema for CustomerAccountEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        "parties.customer_account.email_address_changed",
        "parties.customer_account.order_confirmation_email_sent",
        "parties.customer_account.order_cancelation_confirmation_email_sent",
    ];
}

impl Aggregate for CustomerAccount {
    type Command = CustomerAccountCommand;
    type Event = CustomerAccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CustomerAccountEvent::EmailAddressChanged(e) => {
                self.email_address = Some(e.email_address.clone());
            }
            CustomerAccountEvent::OrderConfirmationEmailSent(_) => {
                self.order_confirmations_sent += 1;
            }
            CustomerAccountEvent::OrderCancelationConfirmationEmailSent(_) => {
                self.cancelation_confirmations_sent += 1;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CustomerAccountCommand::ChangeEmailAddress(cmd) => self.handle_change_email_address(cmd),
            CustomerAccountCommand::SendOrderConfirmationEmail(cmd) => {
                let email_address = self.ensure_email_address()?;
                Ok(vec![CustomerAccountEvent::OrderConfirmationEmailSent(
                    OrderConfirmationEmailSent {
                        order_id: cmd.order_id,
                        email_address,
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
            CustomerAccountCommand::SendOrderCancellationConfirmationEmail(cmd) => {
                let email_address = self.ensure_email_address()?;
                Ok(vec![CustomerAccountEvent::OrderCancelationConfirmationEmailSent(
                    OrderCancelationConfirmationEmailSent {
                        order_id: cmd.order_id,
                        email_address,
                        occurred_at: cmd.occurred_at,
                    },
                )])
            }
        }
    }
}

impl EventSourced for CustomerAccount {
    const AGGREGATE_TYPE: &'static str = "parties.customer_account";
    const COMMAND_SCHEDULED_EVENT: &'static str = "parties.customer_account.command_scheduled";

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            email_address: None,
            order_confirmations_sent: 0,
            cancelation_confirmations_sent: 0,
            version: 0,
        }
    }
}

impl CustomerAccount {
    fn ensure_email_address(&self) -> Result<String, DomainError> {
        self.email_address
            .clone()
            .ok_or_else(|| DomainError::invariant("customer account has no email address"))
    }

    fn handle_change_email_address(
        &self,
        cmd: &ChangeEmailAddress,
    ) -> Result<Vec<CustomerAccountEvent>, DomainError> {
        let email_address = cmd.email_address.trim();
        if !is_plausible_email(email_address) {
            return Err(DomainError::validation("email_address is not valid"));
        }
        if self.email_address.as_deref() == Some(email_address) {
            return Ok(Vec::new());
        }

        Ok(vec![CustomerAccountEvent::EmailAddressChanged(EmailAddressChanged {
            email_address: email_address.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

fn is_plausible_email(candidate: &str) -> bool {
    match candidate.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}
