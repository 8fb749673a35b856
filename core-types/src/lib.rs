// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shared types, configuration and retry policy for the aggtrades pipeline.

pub mod config;
pub mod retry;
pub mod types;
