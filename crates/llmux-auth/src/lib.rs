//! Credential core for llmux.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. It owns the auth data model, the selection/cool-down machinery,
//! the executor contract and the secret sources; the router crate performs
//! the actual IO.

pub mod auth_file;
pub mod entity;
pub mod error;
pub mod executor;
pub mod headers;
pub mod manager;
pub mod model;
pub mod runtime;
pub mod secret;
pub mod store;

pub use auth_file::AuthFile;
pub use entity::{
    Attributes, Auth, AuthStatus, AuthUpdate, AuthUpdateAction, LastError, Metadata, ModelState,
    QuotaState, RuntimeHandle,
};
pub use error::{AuthError, ExecError, ExecErrorKind};
pub use executor::{
    ChunkStream, ExecCtx, ExecOptions, ExecRequest, ExecResponse, Executor, StreamResult,
    CLOSE_ALL_EXECUTION_SESSIONS,
};
pub use headers::{header_get, header_remove, header_set, Headers};
pub use manager::retry::{should_retry_after_error, RetryConfig};
pub use manager::select::{
    FillFirstSelector, PickError, PickOptions, RoundRobinSelector, Selector,
};
pub use manager::{
    AuthManager, ExecReport, ListFilter, OpCtx, Outcome, RefreshPolicy, MIXED_PROVIDER,
};
pub use model::alias::AliasTable;
pub use model::mapping::ModelMapper;
pub use model::suffix::{parse_suffix, with_suffix, ParsedModel};
pub use runtime::{PoolTokens, SharedTokenPool};
pub use secret::{
    MappedSecretSource, MultiSourceSecret, SecretCtx, SecretError, SecretSource,
    StaticSecretSource,
};
pub use store::{FileTokenStore, StoreError, TokenStore};
