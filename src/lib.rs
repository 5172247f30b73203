pub mod config;
pub mod existing;
pub mod fieldmap;
pub mod handler;
pub mod healthcheck;
pub mod nscache;
pub mod patch;
pub mod registrar;
pub mod rule;
pub mod selector;
pub mod template;
pub mod validation;
