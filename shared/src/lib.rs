//! Shared utilities for the upload relay services

pub mod observability;
