//! reelcycle: rotates a content backlog through render, caption and schedule
//! job services.

pub mod config;
pub mod cost;
pub mod db;
pub mod detector;
pub mod engine;
pub mod error;
pub mod model;
pub mod resilience;
pub mod rotation;
pub mod services;
pub mod web;
pub mod workflow;
