//! CLI subcommand implementations.

pub mod attach;
pub mod close;
pub mod new;
pub mod sessions;
