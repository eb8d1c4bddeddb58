pub mod adb;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod report;
pub mod session;
