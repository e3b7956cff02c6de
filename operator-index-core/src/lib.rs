//! Operator index library exports

pub mod catalog;
pub mod config;
pub mod error;
pub mod release;

pub use error::{IndexError, Result, Stage};
pub use release::{ReleaseOptions, ReleaseOutcome, ReleasePipeline, ReleasePlan};
