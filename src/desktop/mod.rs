//! Desktop utility
//!
//! A small always-on-top control window: capture a screen region, recognize
//! it with the local worker (or a remote service) and copy the LaTeX.

pub mod app;
pub mod components;
pub mod state;
pub mod theme;
pub mod update;

pub use app::run_desktop;
