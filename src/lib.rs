pub mod audit;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod runtime;
pub mod store;
pub mod ui;
