//! Command implementations for the CLI.

mod action;
mod scan;

pub use action::{ActionArgs, cmd_action, cmd_read};
pub use scan::cmd_scan;
