//! Module system: capabilities, injection, discovery and the loader.
//!
//! Everything here runs on the boot thread; modules are loaded sequentially
//! in dependency order.

pub mod capability;
pub mod context;
pub mod extension;
pub mod injection;
pub mod loader;
pub mod locator;
