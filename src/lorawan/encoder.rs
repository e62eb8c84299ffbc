//! Cleartext data frame assembly
//!
//! Builds the MHDR..FRMPayload bytes the MAC engine hands to
//! `SecureElement::encode_message`, together with the offset of the
//! FRMPayload. The secure element encrypts the payload and appends the MIC.
//!
//! Frame structure before encoding:
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(N) | [FPort(1) | FRMPayload(N)]

use super::MType;

/// Cleartext frame plus where its FRMPayload starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub bytes: Vec<u8>,
    /// Equal to `bytes.len()` when the frame carries no payload
    pub payload_offset: usize,
}

/// Parameters for building a LoRaWAN data frame
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    /// Message type (UnconfirmedDataUp for a plain uplink)
    pub mtype: MType,
    /// Device address (32-bit)
    pub dev_addr: u32,
    /// Frame counter; only the low 16 bits go on the wire
    pub fcnt: u32,
    pub adr: bool,
    pub ack: bool,
    /// Piggybacked MAC commands (cleartext, at most 15 bytes)
    pub f_opts: Vec<u8>,
    /// FPort (0 for MAC commands in FRMPayload, 1-223 for application data)
    pub f_port: u8,
    /// Application payload (cleartext)
    pub payload: Vec<u8>,
}

impl FrameBuilder {
    /// Create a new frame builder for an unconfirmed uplink
    pub fn new_uplink(dev_addr: u32, fcnt: u32, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: MType::UnconfirmedDataUp,
            dev_addr,
            fcnt,
            adr: false,
            ack: false,
            f_opts: Vec::new(),
            f_port,
            payload,
        }
    }

    /// Create a new frame builder for an unconfirmed downlink
    pub fn new_downlink(dev_addr: u32, fcnt: u32, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: MType::UnconfirmedDataDown,
            ..Self::new_uplink(dev_addr, fcnt, f_port, payload)
        }
    }

    /// Build the cleartext frame, MIC not included
    pub fn build(&self) -> anyhow::Result<Message> {
        if self.mtype.direction().is_none() {
            return Err(anyhow::anyhow!("{} is not a data frame type", self.mtype));
        }
        if self.f_opts.len() > 15 {
            return Err(anyhow::anyhow!(
                "FOpts limited to 15 bytes, got {}",
                self.f_opts.len()
            ));
        }

        let mut frame = Vec::with_capacity(9 + self.f_opts.len() + self.payload.len());
        frame.push(self.mtype.mhdr());

        // DevAddr (4 bytes, little-endian)
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());

        // FCtrl: ADR | ACK | FOptsLen
        let mut fctrl = self.f_opts.len() as u8;
        if self.adr {
            fctrl |= 0x80;
        }
        if self.ack {
            fctrl |= 0x20;
        }
        frame.push(fctrl);

        // FCnt (low 16 bits, little-endian)
        frame.extend_from_slice(&(self.fcnt as u16).to_le_bytes());
        frame.extend_from_slice(&self.f_opts);

        // FPort only if payload is present
        if !self.payload.is_empty() {
            frame.push(self.f_port);
            frame.extend_from_slice(&self.payload);
        }

        let payload_offset = frame.len() - self.payload.len();
        Ok(Message {
            bytes: frame,
            payload_offset,
        })
    }
}
