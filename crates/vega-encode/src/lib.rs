#![doc = include_str!("../README.md")]

pub mod convert;
pub mod nal;
pub mod qp_table;
pub mod rate;
pub mod session;
pub mod sim;
pub mod sink;
pub mod surface_pool;
pub mod worker;
