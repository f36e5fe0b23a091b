//! Shared configuration model for llmux.
//!
//! This crate intentionally has no async or HTTP dependencies. Everything
//! here is plain data that the core, watcher and router crates consume.

pub mod config;

pub use config::{
    AliasRule, AmpConfig, AppConfig, ConfigError, ModelMappingRule, ProviderKeyEntry,
    RemoteManagement, RoutingStrategy, UpstreamKeyMapping, OAUTH_ALIAS_CHANNELS,
};
