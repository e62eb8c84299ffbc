use std::io::BufRead;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_se::config::{self, Config};
use lora_se::lorawan::encoder::FrameBuilder;
use lora_se::lorawan::{DataHeader, MType, JOIN_ACCEPT_CFLIST_LEN, JOIN_REQUEST_LEN, MIC_LEN};
use lora_se::se::{ConfiguredDriver, FrameContext, KeySelector, SecureElement};

#[derive(Parser)]
#[command(name = "lora-se")]
#[command(about = "LoRaWAN end-device secure element")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a join-request, then decode the join-accept read from stdin
    Join,
    /// Encrypt and sign an uplink with the configured ABP session
    Encode {
        /// Full 32-bit frame counter
        #[arg(long)]
        fcnt: u32,
        #[arg(long, default_value_t = 1)]
        fport: u8,
        #[arg(long)]
        confirmed: bool,
        /// Application payload, hex
        payload: String,
    },
    /// Verify and decrypt a downlink for the configured ABP session
    Decode {
        /// Full 32-bit downlink frame counter
        #[arg(long)]
        fcnt: u32,
        /// PHY payload, hex
        frame: String,
    },
    /// Encrypt one AES-128 block
    Aes {
        /// Key, 32 hex digits
        #[arg(long)]
        key: String,
        /// Block, 32 hex digits
        block: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // No fallback: an unprovisioned device has no keys to run with
    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut se = ConfiguredDriver::new();
    config.provision(&mut se)?;

    match cli.command {
        Command::Join => join(&mut se, &config),
        Command::Encode {
            fcnt,
            fport,
            confirmed,
            payload,
        } => encode(&se, &config, fcnt, fport, confirmed, &payload),
        Command::Decode { fcnt, frame } => decode(&se, &config, fcnt, &frame),
        Command::Aes { key, block } => {
            let key = config::parse_key(&key)?;
            let block: [u8; 16] = hex::decode(block.trim())?
                .try_into()
                .map_err(|_| anyhow::anyhow!("Block must be 16 bytes"))?;
            println!("{}", hex::encode(se.aes128_encrypt(&key, &block)));
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).map_err(|e| anyhow::anyhow!("Cannot provision the secure element: {}", e))
}

fn join(se: &mut ConfiguredDriver, config: &Config) -> anyhow::Result<()> {
    let format = config.device.join_format;
    let mut request = [0u8; JOIN_REQUEST_LEN];
    let len = se.create_join_request(&mut request, format)?;
    println!("{}", hex::encode(&request[..len]));

    info!("Waiting for join-accept (hex) on stdin");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let frame = hex::decode(line.trim())?;

    let mut clear = [0u8; JOIN_ACCEPT_CFLIST_LEN];
    let accept = se.decode_join_accept(&frame, &mut clear, format)?;
    println!("{}", accept);
    Ok(())
}

fn encode(
    se: &ConfiguredDriver,
    config: &Config,
    fcnt: u32,
    fport: u8,
    confirmed: bool,
    payload: &str,
) -> anyhow::Result<()> {
    let session = config
        .session
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("encode needs a [session] section"))?;

    let mut builder = FrameBuilder::new_uplink(session.dev_addr()?, fcnt, fport, hex::decode(payload.trim())?);
    if confirmed {
        builder.mtype = MType::ConfirmedDataUp;
    }
    let message = builder.build()?;

    let mut out = vec![0u8; message.bytes.len() + MIC_LEN];
    let len = se.encode_message_with(
        &message.bytes,
        message.payload_offset,
        &mut out,
        KeySelector::Unicast,
        &FrameContext::new(fcnt),
    )?;
    println!("{}", hex::encode(&out[..len]));
    Ok(())
}

fn decode(se: &ConfiguredDriver, config: &Config, fcnt: u32, frame: &str) -> anyhow::Result<()> {
    let session = config
        .session
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("decode needs a [session] section"))?;
    let dev_addr = session.dev_addr()?;
    let phy = hex::decode(frame.trim())?;

    if !se.verify_mic(&phy, dev_addr, fcnt, KeySelector::Unicast)? {
        warn!(dev_addr = format_args!("{:08X}", dev_addr), fcnt, "MIC check failed");
        return Err(anyhow::anyhow!("MIC check failed, frame discarded"));
    }

    let mut clear = vec![0u8; phy.len()];
    let len = se.decode_message(&phy, dev_addr, fcnt, KeySelector::Unicast, &mut clear)?;
    let header = DataHeader::parse(&clear[..len])?;
    println!("{}", header);

    let port_offset = header.fport_offset();
    if len > port_offset {
        println!("FPort={} Payload={}", clear[port_offset], hex::encode(&clear[port_offset + 1..len]));
    }
    Ok(())
}
