//! LoRaWAN end-device secure element
//!
//! - `se`: key store, join and frame cryptography behind the
//!   [`se::SecureElement`] capability trait
//! - `lorawan`: wire layout of join and data frames
//! - `gwmp`: Semtech packet-forwarder framing used by the device simulator
//! - `config`: TOML device provisioning

pub mod config;
pub mod gwmp;
pub mod lorawan;
pub mod se;
