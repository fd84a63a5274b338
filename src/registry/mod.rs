//! C3/C4 — Host and Credential registries, plus shared JSON persistence.

pub mod credentials;
pub mod folders;
pub mod hosts;
pub(crate) mod storage;

pub use credentials::{CredentialChange, CredentialInput, CredentialRegistry};
pub use folders::FolderRegistry;
pub use hosts::{BulkResult, HostInput, HostRegistry, TagMode};
