pub mod cancel;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod model;
pub mod remote;
