//! Delivery mechanisms that hand a transfer's payload to its recipients.

pub mod email;
pub mod mechanism;
pub mod memory;

pub use email::{EmailDelivery, SmtpConfig};
pub use mechanism::{
    DeliveryError, DeliveryMechanism, DeliveryReceipt, DeliveryRegistry, DeliveryRequest,
};
pub use memory::{DeliveredMessage, InMemoryDelivery};
