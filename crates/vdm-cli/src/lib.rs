// vdm-cli: clap commands, display, logging bootstrap

pub mod commands;
pub mod display;
pub mod logging;

pub use commands::run;
