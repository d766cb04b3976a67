pub mod access;
pub mod activity;
pub mod auth;
pub mod catalogue;
pub mod cleanup;
pub mod config;
pub mod copy;
pub mod db;
pub mod error;
pub mod files;
pub mod graph;
pub mod matching;
pub mod models;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils;
