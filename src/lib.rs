pub mod alert;
pub mod analysis;
pub mod config;
pub mod db;
pub mod forecast;
pub mod ingest;
pub mod logging;
pub mod meters;
pub mod model;
pub mod tick;
pub mod verify;
