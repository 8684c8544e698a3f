pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod orchestration;
pub mod session;
pub mod tools;
pub mod turn;
