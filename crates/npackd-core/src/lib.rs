pub mod config;
pub mod download;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod oracle;
pub mod refresh;
pub mod repository;
pub mod sqlite;
