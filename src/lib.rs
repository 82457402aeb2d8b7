pub mod chain;
pub mod config;
pub mod db;
pub mod endpoints;
pub mod notifier;
pub mod reconciler;
pub mod responses;
pub mod scheduler;
pub mod wallet;
