//! LoRaWAN wire layout shared by the secure element and its callers
//!
//! Frame structure (data frames):
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(0..15) | [FPort(1) | FRMPayload(N)] | MIC(4)
//!
//! Join frames:
//!   JoinRequest: MHDR | JoinEUI(8,LE) | DevEUI(8,LE) | DevNonce(2,LE) | MIC(4)
//!   JoinAccept:  MHDR | JoinNonce(3) | NetID(3) | DevAddr(4) | DLSettings(1) | RxDelay(1) | [CFList(16)] | MIC(4)

pub mod encoder;

use std::fmt;

use crate::se::{Error, JoinFormat, Result};

/// Length of the MAC header
pub const MHDR_LEN: usize = 1;
/// Length of the Message Integrity Code
pub const MIC_LEN: usize = 4;
/// MHDR + DevAddr + FCtrl + FCnt
pub const DATA_HEADER_MIN_LEN: usize = 8;
/// Complete join-request frame
pub const JOIN_REQUEST_LEN: usize = 23;
/// Join-accept without CFList
pub const JOIN_ACCEPT_LEN: usize = 17;
/// Join-accept carrying a 16-byte CFList
pub const JOIN_ACCEPT_CFLIST_LEN: usize = 33;

/// DLSettings bit set by a LoRaWAN 1.1 join server
pub const DL_SETTINGS_OPT_NEG: u8 = 0x80;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl MType {
    /// MHDR byte for this type with Major = LoRaWAN R1
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    /// Direction of a data frame; `None` for join and proprietary frames
    pub fn direction(self) -> Option<Direction> {
        match self {
            MType::UnconfirmedDataUp | MType::ConfirmedDataUp => Some(Direction::Uplink),
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown => Some(Direction::Downlink),
            _ => None,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame direction as encoded in the A and B0 crypto blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// Frame Control byte (FCtrl)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub f_opts_len: u8,
}

impl From<u8> for FCtrl {
    fn from(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Parsed MHDR + FHDR of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub mtype: MType,
    pub direction: Direction,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    /// Low 16 bits of the frame counter
    pub fcnt: u16,
}

impl DataHeader {
    /// Parse the header at the start of `data`. Trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DATA_HEADER_MIN_LEN {
            return Err(Error::MalformedFrame("data frame header too short"));
        }
        let mtype = MType::from(data[0]);
        let direction = mtype
            .direction()
            .ok_or(Error::MalformedFrame("not a data frame"))?;
        if data[0] & 0x03 != 0 {
            return Err(Error::MalformedFrame("unsupported major version"));
        }

        let header = Self {
            mtype,
            direction,
            dev_addr: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
            fctrl: FCtrl::from(data[5]),
            fcnt: u16::from_le_bytes([data[6], data[7]]),
        };
        if header.fport_offset() > data.len() {
            return Err(Error::MalformedFrame("FOpts exceed frame"));
        }
        Ok(header)
    }

    /// Length of MHDR + FHDR including FOpts; FPort follows.
    pub fn fport_offset(&self) -> usize {
        DATA_HEADER_MIN_LEN + self.fctrl.f_opts_len as usize
    }
}

impl fmt::Display for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={:08X} FCnt={} FOpts={} ADR={} ACK={}",
            self.mtype, self.dev_addr, self.fcnt, self.fctrl.f_opts_len, self.fctrl.adr, self.fctrl.ack,
        )
    }
}

/// Device identity used in join-requests
///
/// EUIs are held in their conventional (big-endian, as printed) order and
/// serialised little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub dev_eui: u64,
    pub join_eui: u64,
}

/// Fields of a decrypted, authenticated join-accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccept {
    /// AppNonce (1.0) / JoinNonce (1.1), 24 bits
    pub join_nonce: u32,
    /// NetID (1.1: Home_NetID), 24 bits
    pub net_id: u32,
    pub dev_addr: u32,
    pub dl_settings: u8,
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
    /// Generation the resulting session runs under
    pub format: JoinFormat,
}

impl JoinAccept {
    /// Read the fields of a cleartext join-accept (MHDR through MIC).
    pub(crate) fn parse(clear: &[u8], format: JoinFormat) -> Result<Self> {
        if clear.len() != JOIN_ACCEPT_LEN && clear.len() != JOIN_ACCEPT_CFLIST_LEN {
            return Err(Error::MalformedFrame("join-accept length"));
        }
        let cf_list = if clear.len() == JOIN_ACCEPT_CFLIST_LEN {
            let mut list = [0u8; 16];
            list.copy_from_slice(&clear[13..29]);
            Some(list)
        } else {
            None
        };

        Ok(Self {
            join_nonce: u32::from_le_bytes([clear[1], clear[2], clear[3], 0]),
            net_id: u32::from_le_bytes([clear[4], clear[5], clear[6], 0]),
            dev_addr: u32::from_le_bytes([clear[7], clear[8], clear[9], clear[10]]),
            dl_settings: clear[11],
            rx_delay: clear[12],
            cf_list,
            format,
        })
    }

    pub fn rx1_dr_offset(&self) -> u8 {
        (self.dl_settings >> 4) & 0x07
    }

    pub fn rx2_data_rate(&self) -> u8 {
        self.dl_settings & 0x0F
    }
}

impl fmt::Display for JoinAccept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JoinAccept DevAddr={:08X} NetID={:06X} JoinNonce={:06X} RX1DROffset={} RX2DR={} RxDelay={} CFList={} ({})",
            self.dev_addr,
            self.net_id,
            self.join_nonce,
            self.rx1_dr_offset(),
            self.rx2_data_rate(),
            self.rx_delay,
            if self.cf_list.is_some() { "yes" } else { "no" },
            self.format,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unconfirmed_data_up_header() {
        // MHDR=0x40, DevAddr=0x01020304, FCtrl=ADR|FOptsLen=1, FCnt=1, FOpts=0x02
        let data: Vec<u8> = vec![
            0x40, // MHDR
            0x04, 0x03, 0x02, 0x01, // DevAddr (LE)
            0x81, // FCtrl
            0x01, 0x00, // FCnt (LE)
            0x02, // FOpts
            0x01, // FPort
            0xAA, 0xBB, // FRMPayload
        ];

        let header = DataHeader::parse(&data).unwrap();
        assert_eq!(header.mtype, MType::UnconfirmedDataUp);
        assert_eq!(header.direction, Direction::Uplink);
        assert_eq!(header.dev_addr, 0x01020304);
        assert!(header.fctrl.adr);
        assert_eq!(header.fcnt, 1);
        assert_eq!(header.fport_offset(), 9);
    }

    #[test]
    fn test_join_frames_are_not_data_frames() {
        let mut data = vec![0u8; 12];
        data[0] = MType::JoinAccept.mhdr();
        assert_eq!(
            DataHeader::parse(&data),
            Err(Error::MalformedFrame("not a data frame"))
        );
    }

    #[test]
    fn test_fopts_longer_than_frame_fails() {
        let data = [0x60, 0x04, 0x03, 0x02, 0x01, 0x0F, 0x00, 0x00, 0x01];
        assert!(DataHeader::parse(&data).is_err());
    }

    #[test]
    fn test_too_short_header_fails() {
        let data: Vec<u8> = vec![0x40, 0x01, 0x02, 0x03, 0x04];
        assert!(DataHeader::parse(&data).is_err());
    }

    #[test]
    fn test_mhdr_round_trips_mtype() {
        for mtype in [
            MType::JoinRequest,
            MType::JoinAccept,
            MType::UnconfirmedDataUp,
            MType::UnconfirmedDataDown,
            MType::ConfirmedDataUp,
            MType::ConfirmedDataDown,
            MType::RejoinRequest,
            MType::Proprietary,
        ] {
            assert_eq!(MType::from(mtype.mhdr()), mtype);
        }
    }

    #[test]
    fn test_parse_join_accept_fields() {
        let clear = hex::decode("200c0b0a130000da1b01260001e672aa70").unwrap();
        let accept = JoinAccept::parse(&clear, JoinFormat::V1_0).unwrap();
        assert_eq!(accept.join_nonce, 0x0A0B0C);
        assert_eq!(accept.net_id, 0x000013);
        assert_eq!(accept.dev_addr, 0x26011BDA);
        assert_eq!(accept.rx_delay, 1);
        assert_eq!(accept.cf_list, None);
    }
}
