#![doc = include_str!("../README.md")]

pub mod runtime;
mod sys;

pub use runtime::OpenClRuntime;
pub use sys::{cl_error_name, describe as describe_cl_error};
