pub mod check;

pub use check::run_plugin_check;
