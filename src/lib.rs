//! Booking and payment lifecycle coordination.
//!
//! The crate is laid out in layers: `domain` holds the entities, their state
//! machines and the ports; `application` drives them through the stores and
//! providers; `infrastructure` implements the ports; `interfaces` holds the
//! CSV replay surface used by the `bookpay` binary.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
