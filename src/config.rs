use serde::Deserialize;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

use crate::se::{DeviceIdentity, JoinFormat, Key, KeyRole, KeySelector, SecureElement};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    /// ABP session; absent for devices that join over the air
    pub session: Option<SessionConfig>,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device identity and root keys, all hex
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    pub dev_eui: String,
    pub join_eui: String,
    pub app_key: String,
    /// LoRaWAN 1.1 network root key
    pub nwk_key: Option<String>,
    #[serde(default)]
    pub join_format: JoinFormat,
}

/// Activation-by-personalisation session, all hex
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub dev_addr: String,
    /// 1.0 NwkSKey, or the 1.1 FNwkSIntKey
    #[serde(alias = "nwk_s_key")]
    pub f_nwk_s_int_key: String,
    /// Defaults to `f_nwk_s_int_key`
    pub s_nwk_s_int_key: Option<String>,
    /// Defaults to `f_nwk_s_int_key`
    pub nwk_s_enc_key: Option<String>,
    pub app_s_key: String,
    #[serde(default)]
    pub format: JoinFormat,
}

#[derive(Debug, Deserialize)]
pub struct ForwarderConfig {
    /// Network server (or gateway bridge) UDP address
    pub server: String,
    pub gateway_eui: String,
    #[serde(default = "default_frequency")]
    pub frequency: f64,
    #[serde(default = "default_data_rate")]
    pub data_rate: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_frequency() -> f64 {
    868.1
}

fn default_data_rate() -> String {
    "SF7BW125".to_string()
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:1700".to_string(),
            gateway_eui: "AABBCCDDEEFF0011".to_string(),
            frequency: default_frequency(),
            data_rate: default_data_rate(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))
    }

    /// Install identity, root keys and (if configured) the ABP session.
    pub fn provision<S: SecureElement>(&self, se: &mut S) -> anyhow::Result<()> {
        let identity = self.device.identity()?;
        se.set_identity(identity);
        se.set_key(
            KeyRole::AppKey,
            KeySelector::Unicast,
            &parse_key(&self.device.app_key)?,
        )?;
        if let Some(nwk_key) = &self.device.nwk_key {
            se.set_key(KeyRole::NwkKey, KeySelector::Unicast, &parse_key(nwk_key)?)?;
        }

        if let Some(session) = &self.session {
            let f_nwk = parse_key(&session.f_nwk_s_int_key)?;
            let s_nwk = match &session.s_nwk_s_int_key {
                Some(hex_key) => parse_key(hex_key)?,
                None => f_nwk.clone(),
            };
            let nwk_enc = match &session.nwk_s_enc_key {
                Some(hex_key) => parse_key(hex_key)?,
                None => f_nwk.clone(),
            };
            se.set_key(KeyRole::FNwkSIntKey, KeySelector::Unicast, &f_nwk)?;
            se.set_key(KeyRole::SNwkSIntKey, KeySelector::Unicast, &s_nwk)?;
            se.set_key(KeyRole::NwkSEncKey, KeySelector::Unicast, &nwk_enc)?;
            se.set_key(
                KeyRole::AppSKey,
                KeySelector::Unicast,
                &parse_key(&session.app_s_key)?,
            )?;
            se.set_session_format(KeySelector::Unicast, session.format)?;
            info!(
                dev_addr = format_args!("{:08X}", session.dev_addr()?),
                format = %session.format,
                "ABP session provisioned"
            );
        }

        info!(
            dev_eui = format_args!("{:016X}", identity.dev_eui),
            join_format = %self.device.join_format,
            "device provisioned"
        );
        Ok(())
    }
}

impl DeviceConfig {
    pub fn identity(&self) -> anyhow::Result<DeviceIdentity> {
        Ok(DeviceIdentity {
            dev_eui: parse_eui(&self.dev_eui)?,
            join_eui: parse_eui(&self.join_eui)?,
        })
    }
}

impl SessionConfig {
    pub fn dev_addr(&self) -> anyhow::Result<u32> {
        u32::from_str_radix(self.dev_addr.trim(), 16)
            .map_err(|e| anyhow::anyhow!("Invalid DevAddr {:?}: {}", self.dev_addr, e))
    }
}

impl ForwarderConfig {
    pub fn gateway_eui(&self) -> anyhow::Result<[u8; 8]> {
        Ok(parse_eui(&self.gateway_eui)?.to_be_bytes())
    }
}

/// EUI-64 as printed (MSB first); `-` and `:` separators are allowed
pub fn parse_eui(s: &str) -> anyhow::Result<u64> {
    let digits: String = s.chars().filter(|c| !matches!(c, '-' | ':')).collect();
    let bytes = hex::decode(digits.trim())
        .map_err(|e| anyhow::anyhow!("Invalid EUI {:?}: {}", s, e))?;
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("EUI must be 8 bytes: {:?}", s))?;
    Ok(u64::from_be_bytes(bytes))
}

/// 128-bit key from 32 hex digits; the decoded buffer is wiped after use
pub fn parse_key(s: &str) -> anyhow::Result<Key> {
    let bytes = Zeroizing::new(
        hex::decode(s.trim()).map_err(|e| anyhow::anyhow!("Invalid key hex: {}", e))?,
    );
    Key::try_from(bytes.as_slice()).map_err(|e| anyhow::anyhow!("Invalid key: {}", e))
}
