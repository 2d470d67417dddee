//! Reusable UI components

pub mod status_card;

pub use status_card::StatusCard;
