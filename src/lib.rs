#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod autopilot;
pub mod config;
pub mod daemon;
pub mod decision_store;
pub mod detector;
pub mod error;
pub mod notify;
#[doc(hidden)]
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod process;
pub mod prompt;
pub mod status;
#[doc(hidden)]
pub mod storage;
pub mod trust_log;

pub use config::Config;
pub use error::{Result, WardenError};
