//! Core identifier types shared by ingress and the worker.

pub mod ids;

pub use ids::{DeliveryId, EntryId};
