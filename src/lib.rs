//! Shopify Catalog Link Checker
//!
//! This library provides the core functionality for shopify-linkcheck, which
//! bulk-verifies external URLs stored in product metafields, classifies the
//! stock state of reachable pages, and drafts or archives products whose
//! links are broken or whose stock has run out.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
