//! Portgate - a local gateway that finds its backends by scanning ports
//!
//! This library provides:
//! - A background port scanner that publishes which ports in a window are
//!   listening or established
//! - A router that maps a machine number to `base_port + machine_no` and
//!   forwards GET requests to the backend on that port when it is online
//! - A `/machine-list` discovery endpoint listing the online machine numbers
//! - An HTTP front end serving the router

pub mod config;
pub mod error;
pub mod logger;
pub mod router;
pub mod scanner;
pub mod server;
pub mod table;
pub mod upstream;
