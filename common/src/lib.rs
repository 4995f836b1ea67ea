// Data-volume triggered scheduling: writer tracking, heartbeat aggregation,
// polling fallback and the schedule registry, plus their collaborators

pub mod aggregator;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod launcher;
pub mod lock;
pub mod models;
pub mod notify;
pub mod periodic;
pub mod polling;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod tracker;
