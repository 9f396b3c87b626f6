use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blackraven_contract::CreateTransferRequest;
use blackraven_delivery::{DeliveryRegistry, InMemoryDelivery};
use blackraven_storage::{BlackravenStorage, InMemoryBlobStore};
use blackraven_transfer::{HashingParams, PassphraseHasher};

use crate::identity::CurrentUser;
use crate::service::{ServiceSettings, TransferService};

pub const PASSPHRASE: &str = "Str0ng!pass";

pub struct Harness {
    pub service: TransferService,
    pub blobs: Arc<InMemoryBlobStore>,
    pub delivery: Arc<InMemoryDelivery>,
    pub user: CurrentUser,
}

pub async fn harness() -> Harness {
    harness_with(ServiceSettings::default()).await
}

pub async fn harness_with(settings: ServiceSettings) -> Harness {
    let storage = BlackravenStorage::in_memory().await.expect("storage");
    let blobs = Arc::new(InMemoryBlobStore::new());
    let delivery = Arc::new(InMemoryDelivery::new());
    let mut registry = DeliveryRegistry::new();
    registry
        .register("email", delivery.clone())
        .register("gmail", delivery.clone());
    let hasher = PassphraseHasher::new(HashingParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .expect("hasher");
    let service = TransferService::new(storage, blobs.clone(), registry, hasher, settings);
    Harness {
        service,
        blobs,
        delivery,
        user: CurrentUser {
            id: "owner-1".to_string(),
            email: "owner@example.com".to_string(),
        },
    }
}

pub fn request(end_date: &str, recipients: &[(&str, &str)]) -> CreateTransferRequest {
    CreateTransferRequest {
        filename: "will.pdf".to_string(),
        media_type: Some("application/pdf".to_string()),
        payload_base64: STANDARD.encode(b"last words"),
        message: Some("open when ready".to_string()),
        start_date: "2020-01-01T00:00:00Z".to_string(),
        end_date: end_date.to_string(),
        recipients: recipients
            .iter()
            .map(|(platform, address)| (platform.to_string(), address.to_string()))
            .collect(),
        deactivation_passphrase: PASSPHRASE.to_string(),
    }
}
