pub mod locator;
pub mod probe;
pub mod runner;
