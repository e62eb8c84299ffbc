//! Key custody for the secure element
//!
//! One root AppKey (plus NwkKey for LoRaWAN 1.1 devices) and a set of
//! session slots: the unicast session and four multicast groups.
//! - Unicast slot: FNwkSIntKey, SNwkSIntKey, NwkSEncKey, AppSKey
//! - Multicast slots: McNwkSKey (stored as SNwkSIntKey) and McAppSKey
//!
//! The store is the only mutator of key material. `get` hands out copies;
//! every `Key` zeroizes itself when dropped.

use std::fmt;

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{Error, JoinFormat, Result};

/// Length of an AES-128 key in bytes
pub const KEY_LEN: usize = 16;

/// Number of multicast groups a device can join
pub const MULTICAST_GROUPS: u8 = 4;

const SESSION_SLOTS: usize = 1 + MULTICAST_GROUPS as usize;

/// 16 bytes of secret key material
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Key {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = value
            .try_into()
            .map_err(|_| Error::InvalidKeyLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

/// Logical role a key plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyRole {
    /// Root key for application session derivation (1.0: the only root)
    AppKey = 0,
    /// Root key for network session derivation (1.1)
    NwkKey = 1,
    /// Network integrity, uplink (1.0: NwkSKey)
    FNwkSIntKey = 2,
    /// Network integrity, downlink (1.0: NwkSKey; multicast: McNwkSKey)
    SNwkSIntKey = 3,
    /// Network encryption of MAC commands (1.0: NwkSKey)
    NwkSEncKey = 4,
    /// Application payload encryption (multicast: McAppSKey)
    AppSKey = 5,
}

impl KeyRole {
    fn is_root(self) -> bool {
        matches!(self, KeyRole::AppKey | KeyRole::NwkKey)
    }

    fn session_index(self) -> Option<usize> {
        match self {
            KeyRole::FNwkSIntKey => Some(0),
            KeyRole::SNwkSIntKey => Some(1),
            KeyRole::NwkSEncKey => Some(2),
            KeyRole::AppSKey => Some(3),
            KeyRole::AppKey | KeyRole::NwkKey => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyRole::AppKey => "AppKey",
            KeyRole::NwkKey => "NwkKey",
            KeyRole::FNwkSIntKey => "FNwkSIntKey",
            KeyRole::SNwkSIntKey => "SNwkSIntKey",
            KeyRole::NwkSEncKey => "NwkSEncKey",
            KeyRole::AppSKey => "AppSKey",
        }
    }
}

impl TryFrom<u8> for KeyRole {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyRole::AppKey),
            1 => Ok(KeyRole::NwkKey),
            2 => Ok(KeyRole::FNwkSIntKey),
            3 => Ok(KeyRole::SNwkSIntKey),
            4 => Ok(KeyRole::NwkSEncKey),
            5 => Ok(KeyRole::AppSKey),
            _ => Err(Error::InvalidRole),
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which session slot a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeySelector {
    /// The device's own session (and the root keys)
    #[default]
    Unicast,
    /// Multicast group 0..=3
    Multicast(u8),
}

impl KeySelector {
    fn slot(self) -> Result<usize> {
        match self {
            KeySelector::Unicast => Ok(0),
            KeySelector::Multicast(group) if group < MULTICAST_GROUPS => Ok(1 + group as usize),
            KeySelector::Multicast(_) => Err(Error::InvalidRole),
        }
    }

    pub fn is_multicast(self) -> bool {
        matches!(self, KeySelector::Multicast(_))
    }
}

impl TryFrom<u8> for KeySelector {
    type Error = Error;

    /// 0 is unicast, 1..=4 are multicast groups 0..=3.
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeySelector::Unicast),
            n if n <= MULTICAST_GROUPS => Ok(KeySelector::Multicast(n - 1)),
            _ => Err(Error::InvalidRole),
        }
    }
}

impl fmt::Display for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySelector::Unicast => write!(f, "unicast"),
            KeySelector::Multicast(group) => write!(f, "multicast#{}", group),
        }
    }
}

/// A complete set of session keys, installed into a slot in one step
#[derive(Debug, Clone)]
pub struct SessionKeys {
    pub f_nwk_s_int_key: Key,
    pub s_nwk_s_int_key: Key,
    pub nwk_s_enc_key: Key,
    pub app_s_key: Key,
}

impl SessionKeys {
    /// LoRaWAN 1.0 sessions use one NwkSKey for every network role.
    pub fn legacy(nwk_s_key: Key, app_s_key: Key) -> Self {
        Self {
            f_nwk_s_int_key: nwk_s_key.clone(),
            s_nwk_s_int_key: nwk_s_key.clone(),
            nwk_s_enc_key: nwk_s_key,
            app_s_key,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionSlot {
    keys: [Option<Key>; 4],
    format: JoinFormat,
}

/// Device key store
#[derive(Debug, Default)]
pub struct KeyStore {
    app_key: Option<Key>,
    nwk_key: Option<Key>,
    sessions: [SessionSlot; SESSION_SLOTS],
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key. Dropped keys are zeroized.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn check(role: KeyRole, selector: KeySelector) -> Result<usize> {
        let slot = selector.slot()?;
        if role.is_root() && selector.is_multicast() {
            return Err(Error::InvalidRole);
        }
        if selector.is_multicast() && !matches!(role, KeyRole::SNwkSIntKey | KeyRole::AppSKey) {
            return Err(Error::InvalidRole);
        }
        Ok(slot)
    }

    /// Store a copy of `key` for `role` in `selector`'s slot, replacing any
    /// previous value.
    pub fn set(&mut self, role: KeyRole, selector: KeySelector, key: &Key) -> Result<()> {
        let slot = Self::check(role, selector)?;
        let entry = match (role, role.session_index()) {
            (KeyRole::AppKey, _) => &mut self.app_key,
            (KeyRole::NwkKey, _) => &mut self.nwk_key,
            (_, Some(index)) => &mut self.sessions[slot].keys[index],
            (_, None) => return Err(Error::InvalidRole),
        };
        *entry = Some(key.clone());
        debug!(role = role.name(), %selector, "key installed");
        Ok(())
    }

    /// Copy out the key for `role` in `selector`'s slot.
    pub fn get(&self, role: KeyRole, selector: KeySelector) -> Result<Key> {
        self.key(role, selector).cloned()
    }

    /// Borrow a key for use inside the driver without copying it out.
    pub(crate) fn key(&self, role: KeyRole, selector: KeySelector) -> Result<&Key> {
        let slot = Self::check(role, selector)?;
        let entry = match (role, role.session_index()) {
            (KeyRole::AppKey, _) => &self.app_key,
            (KeyRole::NwkKey, _) => &self.nwk_key,
            (_, Some(index)) => &self.sessions[slot].keys[index],
            (_, None) => return Err(Error::InvalidRole),
        };
        entry.as_ref().ok_or(Error::KeyNotSet(role.name()))
    }

    /// Replace a whole session slot. Either every key lands or none does.
    pub fn install_session(
        &mut self,
        selector: KeySelector,
        keys: SessionKeys,
        format: JoinFormat,
    ) -> Result<()> {
        let slot = selector.slot()?;
        self.sessions[slot] = SessionSlot {
            keys: [
                Some(keys.f_nwk_s_int_key),
                Some(keys.s_nwk_s_int_key),
                Some(keys.nwk_s_enc_key),
                Some(keys.app_s_key),
            ],
            format,
        };
        debug!(%selector, ?format, "session keys installed");
        Ok(())
    }

    /// Protocol generation of the keys in a slot
    pub fn session_format(&self, selector: KeySelector) -> Result<JoinFormat> {
        Ok(self.sessions[selector.slot()?].format)
    }

    pub fn set_session_format(&mut self, selector: KeySelector, format: JoinFormat) -> Result<()> {
        self.sessions[selector.slot()?].format = format;
        Ok(())
    }
}
