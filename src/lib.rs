pub mod analysis;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod query;
pub mod queue;
pub mod reaper;
pub mod routes;
pub mod similarity;
pub mod storage;
pub mod worker;
