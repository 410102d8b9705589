//! Integration tests for seacomm

mod common;
mod config;
mod coordinator;
mod port_agent;
mod session;
