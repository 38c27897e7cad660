// lib.rs
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod natural;
pub mod process;
pub mod record;
pub mod report;
pub mod sink;
