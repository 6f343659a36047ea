pub mod auth;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod msgid;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;
pub mod web;
