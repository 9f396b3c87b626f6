pub mod blob;
pub mod repository;

pub use blob::{BlobError, BlobStore, InMemoryBlobStore, LocalBlobStore};
pub use repository::{
    BlackravenStorage, DeliveryRecord, DispatchClaim, NewTransfer, StorageConfig, TransferRecord,
};
