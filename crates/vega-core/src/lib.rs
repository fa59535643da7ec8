#![doc = include_str!("../README.md")]

pub mod bitstream;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;
