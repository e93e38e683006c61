//! Plugins shipped with the binary
//!
//! Useful on their own and as worked examples of the contract: `passthrough`
//! only declares capabilities, `header-stamp` rewrites both flows and
//! `bearer-auth` short-circuits unauthorized requests.

pub mod bearer_auth;
pub mod header_stamp;
pub mod passthrough;

use std::fmt;
use std::sync::Arc;

use crate::plugin::Plugin;

pub use bearer_auth::BearerAuthPlugin;
pub use header_stamp::HeaderStampPlugin;
pub use passthrough::PassthroughPlugin;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BuiltinPlugin {
    #[default]
    Passthrough,
    HeaderStamp,
    BearerAuth,
}

impl BuiltinPlugin {
    pub fn build(self) -> Arc<dyn Plugin> {
        match self {
            BuiltinPlugin::Passthrough => Arc::new(PassthroughPlugin),
            BuiltinPlugin::HeaderStamp => Arc::new(HeaderStampPlugin::new()),
            BuiltinPlugin::BearerAuth => Arc::new(BearerAuthPlugin::new()),
        }
    }
}

impl fmt::Display for BuiltinPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinPlugin::Passthrough => f.write_str("passthrough"),
            BuiltinPlugin::HeaderStamp => f.write_str("header-stamp"),
            BuiltinPlugin::BearerAuth => f.write_str("bearer-auth"),
        }
    }
}
