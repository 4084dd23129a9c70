//! ANPR video processing pipeline
//!
//! Consumes video jobs from a Redis queue, runs a pluggable plate detector
//! over each video, persists plate events with their crops, and raises
//! watchlist alerts through webhooks.

pub mod app_state;
pub mod config;
pub mod db;
pub mod detector;
pub mod media;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
