//! SSTP call setup, steady-state control, and crypto binding.

pub mod binding;
pub mod client;

pub use client::{send_call_connected, SstpControl, SstpRequest};
