//! HTTP front end for llmux: the Amp reverse-proxy gateway, response
//! rewriting, the management localhost guard and the websocket relay.

pub mod amp;
pub mod management;
pub mod relay;
pub mod rewrite;

pub use amp::AmpGateway;
pub use management::localhost_allowed;
pub use relay::{RelayExecutor, RelayHub};
pub use rewrite::{ResponseRewriter, SseRewriter};
