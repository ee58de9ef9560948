pub mod batcher;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod handlers;
pub mod model;
pub mod notifier;
pub mod web;
