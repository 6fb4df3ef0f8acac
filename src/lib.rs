pub mod auth;
pub mod bim;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
