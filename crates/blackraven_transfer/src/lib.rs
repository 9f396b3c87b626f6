//! Domain rules for scheduled transfers: request validation, the deactivation
//! attempt policy, passphrase hashing and display formatting.

pub mod deactivation;
pub mod format;
pub mod passphrase;
pub mod validation;

pub use blackraven_contract::{DeliveryStatus, TransferStatus};
pub use deactivation::{
    incorrect_passphrase_message, AttemptVerdict, DeactivationPolicy, BRUTE_FORCE_MESSAGE,
    DEACTIVATED_MESSAGE, DEFAULT_MAX_DEACTIVATION_ATTEMPTS,
};
pub use format::{format_file_size, format_time_remaining, format_timestamp, parse_timestamp};
pub use passphrase::{HashError, HashingParams, PassphraseHasher};
pub use validation::{
    is_valid_address, passphrase_violations, validate_upload, TransferDraft, UploadPolicy,
    ValidationError,
};
