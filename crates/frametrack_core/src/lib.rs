pub mod catalog;
pub mod config;
pub mod import;
pub mod lookup;
pub mod progress;
pub mod refresh;
pub mod runtime;
pub mod server;
pub mod web;
