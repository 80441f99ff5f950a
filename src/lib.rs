pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod handlers;
pub mod metadata;
pub mod queue;
pub mod scanner;

#[cfg(test)]
mod test_utils;
