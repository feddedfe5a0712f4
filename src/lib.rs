pub mod aggregate;
pub mod archive;
pub mod catalog;
pub mod config;
pub mod day;
pub mod export;
pub mod pipeline;
pub mod store;
