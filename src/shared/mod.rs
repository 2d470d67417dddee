//! Messages between background threads and the desktop UI loop
//!
//! Long-running work (capture, recognition, precision switches, update checks)
//! runs off the UI thread and posts its outcome back as an [`AppEvent`].

pub mod messages;

pub use messages::AppEvent;
