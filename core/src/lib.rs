pub mod clock;
pub mod collections;
pub mod db;
pub mod engine;
pub mod models;
pub mod monitor;
pub mod remote;
pub mod service;
pub mod tables;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;
