#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod health;
pub mod hub;
pub mod maintenance;
pub mod session;
pub mod state;

#[cfg(test)]
mod hub_tests;
