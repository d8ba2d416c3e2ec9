pub mod app;
pub mod cli;
pub mod config;
pub mod data;
pub mod datagov;
pub mod fmt;
pub mod ingest;
pub mod logging;
