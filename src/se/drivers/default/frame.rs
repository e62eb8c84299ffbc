//! Data frame encryption and MIC
//!
//! FRMPayload is encrypted with the keystream
//!   S_i = AES(K, 0x01 | 0x00000000 | Dir | DevAddr | FCnt | 0x00 | i)
//! where K is NwkSEncKey for FPort 0 and AppSKey otherwise.
//!
//! The MIC is the leading bytes of AES-CMAC over `B0 | msg` with
//!   B0 = 0x49 | ConfFCnt | TxDr | TxCh | Dir | DevAddr | FCnt | 0x00 | len(msg)
//! LoRaWAN 1.1 uplinks split the MIC between SNwkSIntKey (over B1, which
//! carries ConfFCnt/TxDr/TxCh) and FNwkSIntKey (over B0 with those zeroed).

use tracing::debug;
use zeroize::Zeroizing;

use super::cipher::{aes128_encrypt, cmac, mic_matches, Block};
use crate::lorawan::{DataHeader, Direction, MType, DATA_HEADER_MIN_LEN, MIC_LEN};
use crate::se::{Error, FrameContext, JoinFormat, Key, KeyRole, KeySelector, KeyStore, Result};

/// LoRaWAN frames never exceed 255 bytes; B0 carries the length in one byte.
const MAX_MESSAGE_LEN: usize = 255;

/// Encrypt `message[payload_offset..]` into `out` and append the MIC.
///
/// Direction, DevAddr and FCnt come from the message header; `ctx` supplies
/// the full counter and the 1.1 MIC fields.
pub fn encode(
    store: &KeyStore,
    message: &[u8],
    payload_offset: usize,
    out: &mut [u8],
    selector: KeySelector,
    ctx: Option<&FrameContext>,
) -> Result<usize> {
    let header = DataHeader::parse(message)?;
    let len = message.len();
    if len > MAX_MESSAGE_LEN - MIC_LEN {
        return Err(Error::MalformedFrame("frame too long"));
    }
    if payload_offset > len {
        return Err(Error::MalformedFrame("payload offset beyond message"));
    }
    let has_payload = payload_offset < len;
    if has_payload && payload_offset != header.fport_offset() + 1 {
        return Err(Error::MalformedFrame("payload must follow FPort"));
    }

    let ctx = match ctx {
        Some(ctx) if ctx.fcnt as u16 != header.fcnt => {
            return Err(Error::MalformedFrame("frame counter does not match header"));
        }
        Some(ctx) => *ctx,
        None => FrameContext::new(u32::from(header.fcnt)),
    };

    let needed = len + MIC_LEN;
    if out.len() < needed {
        return Err(Error::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let enc_key = if has_payload {
        Some(payload_key(store, selector, message[payload_offset - 1])?)
    } else {
        None
    };
    let mic_keys = MicKeys::resolve(store, selector, header.direction)?;

    out[..len].copy_from_slice(message);
    if let Some(key) = enc_key {
        apply_keystream(
            key,
            header.direction,
            header.dev_addr,
            ctx.fcnt,
            &mut out[payload_offset..len],
        );
    }

    let mic = mic_keys.compute(header.direction, header.dev_addr, &ctx, &out[..len]);
    out[len..needed].copy_from_slice(&mic);
    debug!(
        dev_addr = format_args!("{:08X}", header.dev_addr),
        fcnt = ctx.fcnt,
        %selector,
        "frame encoded"
    );
    Ok(needed)
}

/// Recompute the MIC of `phy_payload` and compare it with the trailing bytes.
///
/// Frames whose MHDR is not a LoRaWAN R1 data frame cannot carry a valid
/// data MIC and verify as false.
pub fn verify(
    store: &KeyStore,
    phy_payload: &[u8],
    dev_addr: u32,
    selector: KeySelector,
    ctx: &FrameContext,
) -> Result<bool> {
    let len = phy_payload.len();
    if len < DATA_HEADER_MIN_LEN + MIC_LEN {
        return Err(Error::MalformedFrame("data frame too short"));
    }
    if len > MAX_MESSAGE_LEN {
        return Err(Error::MalformedFrame("frame too long"));
    }

    let direction = match MType::from(phy_payload[0]).direction() {
        Some(direction) if phy_payload[0] & 0x03 == 0 => direction,
        _ => {
            debug!(mhdr = phy_payload[0], "not a data frame, MIC cannot verify");
            return Ok(false);
        }
    };

    let (msg, received) = phy_payload.split_at(len - MIC_LEN);
    let mic_keys = MicKeys::resolve(store, selector, direction)?;
    let expected = mic_keys.compute(direction, dev_addr, ctx, msg);
    let valid = mic_matches(&expected, received);
    if !valid {
        debug!(
            dev_addr = format_args!("{:08X}", dev_addr),
            fcnt = ctx.fcnt,
            %selector,
            "MIC mismatch"
        );
    }
    Ok(valid)
}

/// Decrypt the FRMPayload of `phy_payload` into `clear_text`, MIC stripped.
pub fn decode(
    store: &KeyStore,
    phy_payload: &[u8],
    dev_addr: u32,
    fcnt: u32,
    selector: KeySelector,
    clear_text: &mut [u8],
) -> Result<usize> {
    if phy_payload.len() < DATA_HEADER_MIN_LEN + MIC_LEN {
        return Err(Error::MalformedFrame("data frame too short"));
    }
    // The keystream block index is one byte
    if phy_payload.len() > MAX_MESSAGE_LEN {
        return Err(Error::MalformedFrame("frame too long"));
    }
    let msg = &phy_payload[..phy_payload.len() - MIC_LEN];
    let header = DataHeader::parse(msg)?;
    if clear_text.len() < msg.len() {
        return Err(Error::BufferTooSmall {
            needed: msg.len(),
            available: clear_text.len(),
        });
    }

    let port_offset = header.fport_offset();
    let key = match msg.get(port_offset) {
        Some(&port) if msg.len() > port_offset + 1 => Some(payload_key(store, selector, port)?),
        _ => None,
    };

    let clear = &mut clear_text[..msg.len()];
    clear.copy_from_slice(msg);
    if let Some(key) = key {
        apply_keystream(key, header.direction, dev_addr, fcnt, &mut clear[port_offset + 1..]);
    }
    Ok(msg.len())
}

/// FPort 0 carries MAC commands under the network key
fn payload_key(store: &KeyStore, selector: KeySelector, port: u8) -> Result<&Key> {
    match (port, selector.is_multicast()) {
        (0, true) => Err(Error::MalformedFrame("multicast frames carry no MAC commands")),
        (0, false) => store.key(KeyRole::NwkSEncKey, selector),
        _ => store.key(KeyRole::AppSKey, selector),
    }
}

/// XOR `data` with the AES-CTR style keystream for this frame
fn apply_keystream(key: &Key, direction: Direction, dev_addr: u32, fcnt: u32, data: &mut [u8]) {
    let mut a: Block = [0u8; 16];
    a[0] = 0x01;
    a[5] = direction as u8;
    a[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());

    for (i, chunk) in data.chunks_mut(16).enumerate() {
        a[15] = (i + 1) as u8;
        let stream = Zeroizing::new(aes128_encrypt(key, &a));
        for (byte, s) in chunk.iter_mut().zip(stream.iter()) {
            *byte ^= s;
        }
    }
}

fn mic_block(
    direction: Direction,
    dev_addr: u32,
    fcnt: u32,
    conf_fcnt: u16,
    tx_dr: u8,
    tx_ch: u8,
    msg_len: usize,
) -> Block {
    let mut block: Block = [0u8; 16];
    block[0] = 0x49;
    block[1..3].copy_from_slice(&conf_fcnt.to_le_bytes());
    block[3] = tx_dr;
    block[4] = tx_ch;
    block[5] = direction as u8;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = msg_len as u8;
    block
}

/// Network integrity keys needed for one MIC computation
enum MicKeys<'a> {
    /// One key over B0 (1.0 both ways, 1.1 downlink, multicast)
    Single { key: &'a Key, split: bool },
    /// 1.1 uplink: SNwkSIntKey over B1, FNwkSIntKey over B0
    Split { s_int: &'a Key, f_int: &'a Key },
}

impl<'a> MicKeys<'a> {
    fn resolve(store: &'a KeyStore, selector: KeySelector, direction: Direction) -> Result<Self> {
        let format = store.session_format(selector)?;
        let v1_1 = format == JoinFormat::V1_1 && !selector.is_multicast();
        match direction {
            Direction::Uplink if v1_1 => Ok(MicKeys::Split {
                s_int: store.key(KeyRole::SNwkSIntKey, selector)?,
                f_int: store.key(KeyRole::FNwkSIntKey, selector)?,
            }),
            Direction::Uplink => Ok(MicKeys::Single {
                key: store.key(KeyRole::FNwkSIntKey, selector)?,
                split: false,
            }),
            Direction::Downlink => Ok(MicKeys::Single {
                key: store.key(KeyRole::SNwkSIntKey, selector)?,
                split: v1_1,
            }),
        }
    }

    fn compute(&self, direction: Direction, dev_addr: u32, ctx: &FrameContext, msg: &[u8]) -> [u8; MIC_LEN] {
        let mut mic = [0u8; MIC_LEN];
        match self {
            MicKeys::Single { key, split } => {
                // ConfFCnt only enters 1.1 downlink MICs
                let conf_fcnt = if *split { ctx.conf_fcnt } else { 0 };
                let b0 = mic_block(direction, dev_addr, ctx.fcnt, conf_fcnt, 0, 0, msg.len());
                mic.copy_from_slice(&cmac(key, &[&b0[..], msg])[..MIC_LEN]);
            }
            MicKeys::Split { s_int, f_int } => {
                let b0 = mic_block(direction, dev_addr, ctx.fcnt, 0, 0, 0, msg.len());
                let b1 = mic_block(
                    direction,
                    dev_addr,
                    ctx.fcnt,
                    ctx.conf_fcnt,
                    ctx.tx_dr,
                    ctx.tx_ch,
                    msg.len(),
                );
                let cmac_s = cmac(s_int, &[&b1[..], msg]);
                let cmac_f = cmac(f_int, &[&b0[..], msg]);
                mic[..2].copy_from_slice(&cmac_s[..2]);
                mic[2..].copy_from_slice(&cmac_f[..2]);
            }
        }
        mic
    }
}
