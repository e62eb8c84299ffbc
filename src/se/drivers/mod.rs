//! Secure element drivers, one per Cargo feature

#[cfg(feature = "driver-default")]
pub mod default;
