pub mod admission;
pub mod api;
pub mod auth;
pub mod chain;
pub mod cmdlock;
pub mod config;
pub mod database;
pub mod fil;
pub mod logging;
pub mod metrics;
pub mod peer;
pub mod poller;
pub mod proposer;
pub mod signer;
pub mod stopper;
pub mod test_utils;
pub mod tracker;
