//! Feedboard - a personal dashboard server
//!
//! Pulls RSS/Atom feeds, subreddit listings, video channel feeds and live
//! stream status concurrently, caches them, and renders everything that
//! arrived in time into a single page.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod routes;
pub mod timeago;
