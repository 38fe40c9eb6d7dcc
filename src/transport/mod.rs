//! Outer surfaces that feed documents into the [`crate::orchestrator::Pipeline`].
//!
//! A transport owns message retrieval and file download, builds a
//! [`crate::model::DocumentJob`] per incoming document, and implements
//! [`crate::delivery::Delivery`] for the conversation it came from.

pub mod telegram;
