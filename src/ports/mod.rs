//! Ports: the interfaces this crate's domain logic depends on, with
//! concrete implementations living in `adapters`. Each port isolates one
//! external collaborator (X.509 crypto, durable persistence, CA key
//! material resolution, the upstream cloud registry, the shadow
//! transport) so the domain modules (`ca`, `rotation`, `shadow`,
//! `identity`, `session`) can be exercised against in-memory fixtures.

pub mod iot_auth;
pub mod key_provider;
pub mod runtime_store;
pub mod shadow_client;
pub mod x509;

pub use iot_auth::IotAuthClient;
pub use key_provider::KeyProvider;
pub use runtime_store::RuntimeStore;
pub use shadow_client::ShadowClient;
pub use x509::X509Port;
