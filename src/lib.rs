// src/lib.rs
pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;
