//! Config/auth-directory watching for llmux.
//!
//! The watcher observes the YAML config and the auth directory, runs the
//! synthesizers, and dispatches fine-grained add/modify/delete updates into
//! the manager's queue. Nothing here performs upstream IO.

pub mod dispatcher;
pub mod synthesizer;
pub mod watcher;

pub use dispatcher::Dispatcher;
pub use synthesizer::{
    excluded_models_hash, merge_excluded_models, ConfigSynthesizer, FileSynthesizer, Synthesizer,
};
pub use watcher::{spawn_update_applier, WatchError, Watcher};
