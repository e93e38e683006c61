//! Plugin contract, mediation pipeline and serve loop for HTTP-mediating
//! gateway plugins.
//!
//! Plugin authors implement [`plugin::Plugin`] and hand it to
//! [`server::run`]. Hosts register plugins with a [`plugin::PluginManager`]
//! and drive transactions through its [`plugin::Pipeline`].

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod plugins;
pub mod server;
