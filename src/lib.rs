//! Lexical URL threat classification: feature extraction, explainable
//! heuristics, trained classifiers and the fusion layer that turns them
//! into a single verdict.

pub mod boosting;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod forest;
pub mod heuristics;
pub mod linear;
pub mod models;
pub mod routes;
pub mod storage;
pub mod trainer;
pub mod tree;
pub mod types;

pub use config::Config;
pub use engine::ThreatEngine;
pub use error::AppError;
pub use types::{BatchItem, ThreatCategory, Verdict};
