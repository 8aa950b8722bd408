//! Azure adapters for the sensor producer.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Implements the `domain` ports against Azure REST APIs
//! using `reqwest`. Nothing here is referenced by `domain` or `simulator`;
//! the `cli` composition root wires these in.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`credential`] | `TokenCredential`, managed identity and static tokens |
//! | [`eventhub`] | `EventHubPublisher` (implements `EventPublisher`) |
//! | [`keyvault`] | `KeyVaultClient` (implements `SecretProvider`) |
//! | [`blob`] | `BlobClient` for dataset download |
//! | [`error`] | `AzureError` |

pub mod blob;
pub mod credential;
pub mod error;
pub mod eventhub;
pub mod keyvault;

pub use blob::{BlobClient, STORAGE_SCOPE};
pub use credential::{
    AccessToken, ManagedIdentityCredential, StaticTokenCredential, TokenCredential,
};
pub use error::AzureError;
pub use eventhub::{
    namespace_endpoint, shared_access_signature, EventHubAuth, EventHubConnectionString,
    EventHubPublisher, EVENT_HUBS_SCOPE,
};
pub use keyvault::{is_valid_secret_name, KeyVaultClient, KEY_VAULT_SCOPE};
