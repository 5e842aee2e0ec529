//! Embeddable MQTT 3.1.1 client engine with connection profiles and a small CLI
//!
//! The [`mqtt`] module is self-contained; [`persistence`] and [`config`] serve the
//! `mqtt-explorer` binary.

pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod simulator;
