pub mod authority;
pub mod config;
pub mod error;
pub mod registry;
pub mod rotation;
pub mod store;

pub use authority::{CredentialAuthority, IamSessionFactory, SessionCredentials, SessionFactory};
pub use config::{CredentialFields, RotationConfig};
pub use error::{AuthorityError, RegistryError, RotationError, StoreError};
pub use rotation::{RotationContext, RotationRunner, RunReport, RunStatus};
pub use store::{KubernetesSecretStore, SecretStore};
