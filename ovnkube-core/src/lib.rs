pub mod allocations;
pub mod config;
pub mod exec;
pub mod helpers;
pub mod ip;
pub mod kubernetes;
pub mod nbdb;
pub mod topology;
