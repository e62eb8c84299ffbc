//! LoRaWAN secure element
//!
//! Key custody and every cryptographic transformation of frames exchanged
//! between the device and the network server:
//! - Key store (root keys and session keys by role)
//! - Random source for DevNonces
//! - Join-request construction and join-accept decoding
//! - Uplink encoding, downlink MIC verification and decryption
//! - Raw AES-128 block encryption
//!
//! Exactly one driver is bound at build time through a Cargo feature and
//! exposed as [`ConfiguredDriver`]. Callers either own a driver value
//! directly or go through the process-wide surface in [`api`].

pub mod api;
pub mod drivers;
pub mod error;
pub mod keys;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use keys::{Key, KeyRole, KeySelector, KeyStore, SessionKeys, KEY_LEN};

pub use crate::lorawan::{DeviceIdentity, JoinAccept};

#[cfg(feature = "driver-default")]
pub use drivers::default::DefaultDriver;

/// The driver selected at build time
#[cfg(feature = "driver-default")]
pub type ConfiguredDriver = drivers::default::DefaultDriver;

#[cfg(not(feature = "driver-default"))]
compile_error!("lora-se needs a secure element driver: enable the `driver-default` feature");

/// Protocol generation used for a join transaction and the session it creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JoinFormat {
    /// LoRaWAN 1.0.x: AppKey root, single NwkSKey
    #[default]
    #[serde(rename = "1.0")]
    V1_0,
    /// LoRaWAN 1.1: NwkKey/AppKey roots, split network session keys
    #[serde(rename = "1.1")]
    V1_1,
}

impl fmt::Display for JoinFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinFormat::V1_0 => write!(f, "LoRaWAN 1.0"),
            JoinFormat::V1_1 => write!(f, "LoRaWAN 1.1"),
        }
    }
}

/// Counter and radio parameters that enter the MIC and keystream
///
/// The FHDR only carries the low 16 bits of the frame counter; the full
/// 32-bit value lives with the MAC engine. `conf_fcnt`, `tx_dr` and `tx_ch`
/// are only used by LoRaWAN 1.1 sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameContext {
    /// Full 32-bit frame counter
    pub fcnt: u32,
    /// Counter of the frame being acknowledged (ACK bit set), else 0
    pub conf_fcnt: u16,
    /// Uplink data rate index
    pub tx_dr: u8,
    /// Uplink channel index
    pub tx_ch: u8,
}

impl FrameContext {
    pub fn new(fcnt: u32) -> Self {
        Self {
            fcnt,
            ..Self::default()
        }
    }
}

/// The capability surface every secure element driver implements
///
/// Calls are synchronous and run to completion. Nothing here retries or
/// keeps state beyond the key store and the pending join.
pub trait SecureElement {
    /// Clear all keys, identity and join state.
    fn initialize(&mut self);

    fn random_u8(&mut self) -> u8;

    fn random_u16(&mut self) -> u16;

    /// Fill `buf` from the entropy source; `SourceExhausted` if unavailable.
    fn fill_random(&mut self, buf: &mut [u8]) -> Result<()>;

    fn set_identity(&mut self, identity: DeviceIdentity);

    fn set_key(&mut self, role: KeyRole, selector: KeySelector, key: &Key) -> Result<()>;

    /// Copy a key out of the store.
    fn get_key(&self, role: KeyRole, selector: KeySelector) -> Result<Key>;

    /// Record which protocol generation a provisioned (ABP) session uses.
    fn set_session_format(&mut self, selector: KeySelector, format: JoinFormat) -> Result<()>;

    /// Build a join-request into `out`, returning the frame length.
    fn create_join_request(&mut self, out: &mut [u8], format: JoinFormat) -> Result<usize>;

    /// Decrypt and authenticate a join-accept, then install session keys.
    ///
    /// `clear_text` receives MHDR, the decrypted body and MIC. No key is
    /// installed unless the MIC verifies.
    fn decode_join_accept(
        &mut self,
        frame: &[u8],
        clear_text: &mut [u8],
        format: JoinFormat,
    ) -> Result<JoinAccept>;

    /// Encrypt `message[payload_offset..]` and append the MIC.
    ///
    /// `message` runs from MHDR through FRMPayload. Returns the encoded length.
    fn encode_message(
        &self,
        message: &[u8],
        payload_offset: usize,
        out: &mut [u8],
        selector: KeySelector,
    ) -> Result<usize>;

    fn encode_message_with(
        &self,
        message: &[u8],
        payload_offset: usize,
        out: &mut [u8],
        selector: KeySelector,
        ctx: &FrameContext,
    ) -> Result<usize>;

    /// Recompute the MIC over `phy_payload` and compare it with the trailing
    /// four bytes.
    fn verify_mic(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        fcnt_down: u32,
        selector: KeySelector,
    ) -> Result<bool>;

    fn verify_mic_with(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        selector: KeySelector,
        ctx: &FrameContext,
    ) -> Result<bool>;

    /// Decrypt a frame's FRMPayload into `clear_text` (MIC stripped).
    ///
    /// Does not verify the MIC; call [`SecureElement::verify_mic`] first.
    fn decode_message(
        &self,
        phy_payload: &[u8],
        dev_addr: u32,
        fcnt_down: u32,
        selector: KeySelector,
        clear_text: &mut [u8],
    ) -> Result<usize>;

    /// Raw AES-128 block encryption.
    fn aes128_encrypt(&self, key: &Key, input: &[u8; 16]) -> [u8; 16];
}
