//! Cart domain
pub mod aggregates;
pub mod events;
pub mod ports;
pub mod value_objects;
