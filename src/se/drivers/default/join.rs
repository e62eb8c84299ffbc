//! Join-request construction and join-accept decoding
//!
//! LoRaWAN 1.0: AppKey authenticates the join-request, decrypts the
//! join-accept and derives NwkSKey/AppSKey.
//!
//! LoRaWAN 1.1: NwkKey takes over the network side. When the join server
//! sets OptNeg the join-accept MIC is keyed by JSIntKey and four session
//! keys are derived; otherwise the device falls back to 1.0 rules keyed by
//! NwkKey.
//!
//! The join-accept body is "decrypted" with AES encrypt: the server
//! produced it with AES decrypt so devices only need the forward cipher.

use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::cipher::{aes128_encrypt, cmac, mic_matches, Block};
use crate::lorawan::{
    DeviceIdentity, JoinAccept, MType, DL_SETTINGS_OPT_NEG, JOIN_ACCEPT_CFLIST_LEN,
    JOIN_ACCEPT_LEN, JOIN_REQUEST_LEN, MIC_LEN,
};
use crate::se::{Error, JoinFormat, Key, KeyRole, KeySelector, KeyStore, Result, SessionKeys};

/// JoinReqType for a join-request (rejoin types 0..=2 are not issued)
const JOIN_REQ_TYPE: u8 = 0xFF;

/// State carried from a join-request to the matching join-accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingJoin {
    pub dev_nonce: u16,
    pub format: JoinFormat,
}

/// Root key that authenticates the join-request and encrypts the accept
pub fn root_role(format: JoinFormat) -> KeyRole {
    match format {
        JoinFormat::V1_0 => KeyRole::AppKey,
        JoinFormat::V1_1 => KeyRole::NwkKey,
    }
}

/// Write `MHDR | JoinEUI | DevEUI | DevNonce | MIC` into `out`.
pub fn build_join_request(
    store: &KeyStore,
    identity: &DeviceIdentity,
    dev_nonce: u16,
    format: JoinFormat,
    out: &mut [u8],
) -> Result<usize> {
    if out.len() < JOIN_REQUEST_LEN {
        return Err(Error::BufferTooSmall {
            needed: JOIN_REQUEST_LEN,
            available: out.len(),
        });
    }
    let root = store.key(root_role(format), KeySelector::Unicast)?;

    let frame = &mut out[..JOIN_REQUEST_LEN];
    frame[0] = MType::JoinRequest.mhdr();
    frame[1..9].copy_from_slice(&identity.join_eui.to_le_bytes());
    frame[9..17].copy_from_slice(&identity.dev_eui.to_le_bytes());
    frame[17..19].copy_from_slice(&dev_nonce.to_le_bytes());

    let mic = cmac(root, &[&frame[..19]]);
    frame[19..].copy_from_slice(&mic[..MIC_LEN]);
    Ok(JOIN_REQUEST_LEN)
}

/// Decrypt and authenticate a join-accept, install the derived session
/// into the unicast slot and return the decoded fields.
///
/// `clear_text` receives `MHDR | body | MIC` in the clear. On MIC failure it
/// is wiped and the key store is left untouched.
pub fn decode_join_accept(
    store: &mut KeyStore,
    identity: &DeviceIdentity,
    pending: Option<&PendingJoin>,
    frame: &[u8],
    clear_text: &mut [u8],
    format: JoinFormat,
) -> Result<JoinAccept> {
    let len = frame.len();
    if len != JOIN_ACCEPT_LEN && len != JOIN_ACCEPT_CFLIST_LEN {
        return Err(Error::MalformedFrame("join-accept length"));
    }
    if MType::from(frame[0]) != MType::JoinAccept || frame[0] & 0x03 != 0 {
        return Err(Error::MalformedFrame("not a LoRaWAN R1 join-accept"));
    }
    if clear_text.len() < len {
        return Err(Error::BufferTooSmall {
            needed: len,
            available: clear_text.len(),
        });
    }
    let pending = pending.ok_or(Error::NoJoinPending)?;
    if pending.format != format {
        return Err(Error::JoinFormatMismatch);
    }

    let root = store.key(root_role(format), KeySelector::Unicast)?;
    // 1.1 AppSKey is derived from AppKey; fail before touching anything
    let app_key = match format {
        JoinFormat::V1_0 => None,
        JoinFormat::V1_1 => Some(store.key(KeyRole::AppKey, KeySelector::Unicast)?),
    };

    let clear = &mut clear_text[..len];
    clear[0] = frame[0];
    for (src, dst) in frame[1..].chunks(16).zip(clear[1..].chunks_mut(16)) {
        let block: Block = src
            .try_into()
            .map_err(|_| Error::MalformedFrame("join-accept body not block aligned"))?;
        let mut plain = aes128_encrypt(root, &block);
        dst.copy_from_slice(&plain);
        plain.zeroize();
    }

    let opt_neg = format == JoinFormat::V1_1 && clear[11] & DL_SETTINGS_OPT_NEG != 0;
    let signed = &clear[..len - MIC_LEN];
    let expected = if opt_neg {
        let js_int_key = derive_js_int_key(root, identity);
        cmac(
            &js_int_key,
            &[
                &[JOIN_REQ_TYPE],
                &identity.join_eui.to_le_bytes(),
                &pending.dev_nonce.to_le_bytes(),
                signed,
            ],
        )
    } else {
        cmac(root, &[signed])
    };
    let mut mic = [0u8; MIC_LEN];
    mic.copy_from_slice(&expected[..MIC_LEN]);

    if !mic_matches(&mic, &clear[len - MIC_LEN..]) {
        clear.zeroize();
        warn!(%format, "join-accept MIC mismatch, frame discarded");
        return Err(Error::MicMismatch);
    }

    let join_nonce = &clear[1..4];
    let (keys, session_format) = match app_key {
        Some(app_key) if opt_neg => (
            derive_session_keys(root, app_key, identity, join_nonce, pending.dev_nonce),
            JoinFormat::V1_1,
        ),
        _ => (
            derive_legacy_session_keys(root, join_nonce, &clear[4..7], pending.dev_nonce),
            JoinFormat::V1_0,
        ),
    };

    let accept = JoinAccept::parse(clear, session_format)?;
    store.install_session(KeySelector::Unicast, keys, session_format)?;
    info!(
        dev_addr = format_args!("{:08X}", accept.dev_addr),
        net_id = format_args!("{:06X}", accept.net_id),
        session = %session_format,
        "join accepted"
    );
    Ok(accept)
}

/// AES(key, prefix | pad16)
fn derive(key: &Key, prefix: &[u8]) -> Key {
    let mut block = Zeroizing::new([0u8; 16]);
    block[..prefix.len()].copy_from_slice(prefix);
    Key::new(aes128_encrypt(key, &block))
}

/// JSIntKey = AES(NwkKey, 0x06 | DevEUI | pad16)
fn derive_js_int_key(nwk_key: &Key, identity: &DeviceIdentity) -> Key {
    let mut prefix = [0u8; 9];
    prefix[0] = 0x06;
    prefix[1..].copy_from_slice(&identity.dev_eui.to_le_bytes());
    derive(nwk_key, &prefix)
}

/// 1.0 rules: `tag | AppNonce | NetID | DevNonce | pad16`
fn derive_legacy_session_keys(
    root: &Key,
    join_nonce: &[u8],
    net_id: &[u8],
    dev_nonce: u16,
) -> SessionKeys {
    let mut input = [0u8; 9];
    input[1..4].copy_from_slice(join_nonce);
    input[4..7].copy_from_slice(net_id);
    input[7..9].copy_from_slice(&dev_nonce.to_le_bytes());

    input[0] = 0x01;
    let nwk_s_key = derive(root, &input);
    input[0] = 0x02;
    let app_s_key = derive(root, &input);
    SessionKeys::legacy(nwk_s_key, app_s_key)
}

/// 1.1 rules: `tag | JoinNonce | JoinEUI | DevNonce | pad16`
fn derive_session_keys(
    nwk_key: &Key,
    app_key: &Key,
    identity: &DeviceIdentity,
    join_nonce: &[u8],
    dev_nonce: u16,
) -> SessionKeys {
    let mut input = [0u8; 14];
    input[1..4].copy_from_slice(join_nonce);
    input[4..12].copy_from_slice(&identity.join_eui.to_le_bytes());
    input[12..14].copy_from_slice(&dev_nonce.to_le_bytes());

    let mut tagged = |tag: u8, key: &Key| {
        input[0] = tag;
        derive(key, &input)
    };
    SessionKeys {
        f_nwk_s_int_key: tagged(0x01, nwk_key),
        app_s_key: tagged(0x02, app_key),
        s_nwk_s_int_key: tagged(0x03, nwk_key),
        nwk_s_enc_key: tagged(0x04, nwk_key),
    }
}
