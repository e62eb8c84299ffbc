//! Semtech UDP Packet Forwarder Protocol (GWMP), gateway side
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The device simulator plays a gateway: it wraps PHY payloads built by the
//! secure element in PUSH_DATA datagrams and waits for the PUSH_ACK.
//! Header integers are big-endian (network byte order).

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Gateway identifier (EUI-64, 8 bytes)
pub type GatewayEui = [u8; 8];

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Rxpk (received packet) entry of a PUSH_DATA JSON payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception (ISO 8601)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Concentrator timestamp (microseconds)
    pub tmst: u32,
    /// Concentrator IF channel
    pub chan: u8,
    /// RF chain
    pub rfch: u8,
    /// Frequency in MHz
    pub freq: f64,
    /// CRC status: 1 = OK
    pub stat: i8,
    pub modu: String,
    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub datr: String,
    pub codr: String,
    /// RSSI in dBm
    pub rssi: i16,
    /// LoRa signal-to-noise ratio
    pub lsnr: f64,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

impl Rxpk {
    /// Describe a LoRa uplink received at `time` with good CRC
    pub fn lora(phy_payload: &[u8], freq: f64, datr: &str, time: DateTime<Utc>) -> Self {
        Self {
            time: Some(time.to_rfc3339_opts(SecondsFormat::Micros, true)),
            tmst: time.timestamp_subsec_micros(),
            chan: 0,
            rfch: 0,
            freq,
            stat: 1,
            modu: "LORA".to_string(),
            datr: datr.to_string(),
            codr: "4/5".to_string(),
            rssi: -60,
            lsnr: 7.5,
            size: phy_payload.len() as u16,
            data: base64::engine::general_purpose::STANDARD.encode(phy_payload),
        }
    }

    /// Decode the base64 PHY payload
    pub fn phy_payload(&self) -> anyhow::Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| anyhow::anyhow!("Invalid base64 in rxpk.data: {}", e))
    }
}

/// PUSH_DATA JSON body
#[derive(Debug, Serialize, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Vec<Rxpk>,
}

/// Build a PUSH_DATA datagram carrying `rxpk`
pub fn push_data(random_token: u16, gateway_eui: &GatewayEui, rxpk: Vec<Rxpk>) -> anyhow::Result<Bytes> {
    let json = serde_json::to_vec(&PushDataPayload { rxpk })?;
    let mut buf = BytesMut::with_capacity(12 + json.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(random_token);
    buf.put_u8(PacketType::PushData as u8);
    buf.put_slice(gateway_eui);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Parse a 4-byte acknowledgement, returning its token and type
pub fn parse_ack(data: &[u8]) -> anyhow::Result<(u16, PacketType)> {
    if data.len() < 4 {
        return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
    }

    let mut buf = data;
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(anyhow::anyhow!(
            "Unsupported protocol version: 0x{:02x}",
            version
        ));
    }
    let random_token = buf.get_u16();
    let packet_type = PacketType::try_from(buf.get_u8())?;
    match packet_type {
        PacketType::PushAck | PacketType::PullAck => Ok((random_token, packet_type)),
        _ => Err(anyhow::anyhow!(
            "Unexpected packet type for an acknowledgement: {:?}",
            packet_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EUI: GatewayEui = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

    #[test]
    fn test_push_data_layout() {
        let time = Utc.with_ymd_and_hms(2026, 2, 18, 17, 30, 0).unwrap();
        let phy = hex::decode("40F17DBE4900020001954378762B11FF0D").unwrap();
        let datagram = push_data(0x1234, &EUI, vec![Rxpk::lora(&phy, 868.1, "SF7BW125", time)]).unwrap();

        assert_eq!(&datagram[..4], &[0x02, 0x12, 0x34, 0x00]);
        assert_eq!(&datagram[4..12], &EUI);

        let body: PushDataPayload = serde_json::from_slice(&datagram[12..]).unwrap();
        assert_eq!(body.rxpk.len(), 1);
        let rxpk = &body.rxpk[0];
        assert_eq!(rxpk.size, 17);
        assert_eq!(rxpk.time.as_deref(), Some("2026-02-18T17:30:00.000000Z"));
        assert_eq!(rxpk.phy_payload().unwrap(), phy);
    }

    #[test]
    fn test_parse_push_ack() {
        assert_eq!(
            parse_ack(&[0x02, 0xAB, 0xCD, 0x01]).unwrap(),
            (0xABCD, PacketType::PushAck)
        );
    }

    #[test]
    fn test_parse_ack_rejects_garbage() {
        assert!(parse_ack(&[0x02, 0x00]).is_err());
        assert!(parse_ack(&[0x01, 0x00, 0x01, 0x01]).is_err());
        assert!(parse_ack(&[0x02, 0x00, 0x01, 0x09]).is_err());
        assert!(parse_ack(&[0x02, 0x00, 0x01, 0x00]).is_err());
    }
}
