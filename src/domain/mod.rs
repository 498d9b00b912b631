//! Domain model: value objects, entities with their state machines, and the
//! ports the application layer is written against.

pub mod booking;
pub mod fees;
pub mod gateway;
pub mod money;
pub mod payment;
pub mod ports;
