//! Adapters: concrete implementations of the ports in `ports`.

pub mod file_key_provider;
pub mod file_store;
pub mod in_memory_store;
pub mod mock_iot_auth;
pub mod mock_shadow_client;
pub mod rcgen_x509;

#[cfg(feature = "pkcs11")]
pub mod pkcs11_key_provider;

pub use file_key_provider::FileKeyProvider;
pub use file_store::FileRuntimeStore;
pub use in_memory_store::InMemoryRuntimeStore;
pub use mock_iot_auth::MockIotAuthClient;
pub use mock_shadow_client::MockShadowClient;
pub use rcgen_x509::RcgenX509Adapter;
