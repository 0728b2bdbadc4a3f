pub mod commands;
pub mod config;
pub mod console;
pub mod history;
pub mod prompt_loader;
