pub mod api;
pub mod envelope;

pub use api::{
    CreateTransferRequest, DeactivateRequest, DeactivationResponse, DeliveryView, DispatchSummary,
    FieldError, RecipientFailure, SweepReport, TransferView,
};
pub use envelope::{
    DeliveryStatus, EventId, EventName, OwnerId, PlatformName, TransferEventEnvelope, TransferId,
    TransferStatus,
};
