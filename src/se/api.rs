//! Single-instance secure element surface
//!
//! The MAC engine runs on one thread and talks to exactly one secure
//! element. This module owns that instance: [`initialize`] constructs the
//! configured driver, [`reset`] drops it (zeroizing every key), and each
//! free function forwards to the matching [`SecureElement`] operation.
//!
//! The instance is bound to the thread that called [`initialize`]. Calls
//! made before initialization, or from inside another call on the same
//! instance, fail with [`Error::DriverFailure`].

use std::cell::RefCell;

use super::{
    ConfiguredDriver, DeviceIdentity, Error, FrameContext, JoinAccept, JoinFormat, Key, KeyRole,
    KeySelector, Result, SecureElement,
};

thread_local! {
    static DRIVER: RefCell<Option<ConfiguredDriver>> = const { RefCell::new(None) };
}

fn with_driver<T>(f: impl FnOnce(&mut ConfiguredDriver) -> Result<T>) -> Result<T> {
    DRIVER.with(|cell| {
        let mut slot = cell
            .try_borrow_mut()
            .map_err(|_| Error::DriverFailure("secure element re-entered"))?;
        let driver = slot
            .as_mut()
            .ok_or(Error::DriverFailure("secure element not initialized"))?;
        f(driver)
    })
}

/// Construct the configured driver, replacing (and wiping) any previous one.
pub fn initialize() -> Result<()> {
    DRIVER.with(|cell| {
        let mut slot = cell
            .try_borrow_mut()
            .map_err(|_| Error::DriverFailure("secure element re-entered"))?;
        let mut driver = ConfiguredDriver::new();
        driver.initialize();
        *slot = Some(driver);
        Ok(())
    })
}

/// Adopt an already provisioned driver as the instance.
pub fn install(driver: ConfiguredDriver) -> Result<()> {
    DRIVER.with(|cell| {
        let mut slot = cell
            .try_borrow_mut()
            .map_err(|_| Error::DriverFailure("secure element re-entered"))?;
        *slot = Some(driver);
        Ok(())
    })
}

/// Drop the instance. Later calls fail until [`initialize`] runs again.
pub fn reset() {
    DRIVER.with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            slot.take();
        }
    })
}

pub fn is_initialized() -> bool {
    DRIVER.with(|cell| cell.try_borrow().map(|slot| slot.is_some()).unwrap_or(true))
}

pub fn random_u8() -> Result<u8> {
    with_driver(|se| Ok(se.random_u8()))
}

pub fn random_u16() -> Result<u16> {
    with_driver(|se| Ok(se.random_u16()))
}

pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    with_driver(|se| se.fill_random(buf))
}

pub fn set_identity(identity: DeviceIdentity) -> Result<()> {
    with_driver(|se| {
        se.set_identity(identity);
        Ok(())
    })
}

pub fn set_key(role: KeyRole, selector: KeySelector, key: &Key) -> Result<()> {
    with_driver(|se| se.set_key(role, selector, key))
}

pub fn get_key(role: KeyRole, selector: KeySelector) -> Result<Key> {
    with_driver(|se| se.get_key(role, selector))
}

pub fn set_session_format(selector: KeySelector, format: JoinFormat) -> Result<()> {
    with_driver(|se| se.set_session_format(selector, format))
}

pub fn create_join_request(out: &mut [u8], format: JoinFormat) -> Result<usize> {
    with_driver(|se| se.create_join_request(out, format))
}

pub fn decode_join_accept(
    frame: &[u8],
    clear_text: &mut [u8],
    format: JoinFormat,
) -> Result<JoinAccept> {
    with_driver(|se| se.decode_join_accept(frame, clear_text, format))
}

pub fn encode_message(
    message: &[u8],
    payload_offset: usize,
    out: &mut [u8],
    selector: KeySelector,
) -> Result<usize> {
    with_driver(|se| se.encode_message(message, payload_offset, out, selector))
}

pub fn encode_message_with(
    message: &[u8],
    payload_offset: usize,
    out: &mut [u8],
    selector: KeySelector,
    ctx: &FrameContext,
) -> Result<usize> {
    with_driver(|se| se.encode_message_with(message, payload_offset, out, selector, ctx))
}

pub fn verify_mic(
    phy_payload: &[u8],
    dev_addr: u32,
    fcnt_down: u32,
    selector: KeySelector,
) -> Result<bool> {
    with_driver(|se| se.verify_mic(phy_payload, dev_addr, fcnt_down, selector))
}

pub fn verify_mic_with(
    phy_payload: &[u8],
    dev_addr: u32,
    selector: KeySelector,
    ctx: &FrameContext,
) -> Result<bool> {
    with_driver(|se| se.verify_mic_with(phy_payload, dev_addr, selector, ctx))
}

pub fn decode_message(
    phy_payload: &[u8],
    dev_addr: u32,
    fcnt_down: u32,
    selector: KeySelector,
    clear_text: &mut [u8],
) -> Result<usize> {
    with_driver(|se| se.decode_message(phy_payload, dev_addr, fcnt_down, selector, clear_text))
}

pub fn aes128_encrypt(key: &Key, input: &[u8; 16]) -> Result<[u8; 16]> {
    with_driver(|se| Ok(se.aes128_encrypt(key, input)))
}
