//! Device Simulator
//!
//! Plays a LoRaWAN end device behind a packet forwarder: frames are built
//! and signed by the secure element, wrapped in Semtech UDP PUSH_DATA
//! datagrams and sent to a network server. Useful for testing without
//! hardware.
//!
//! Usage: cargo run --bin device-sim -- --config device.toml --uplinks 3

use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_se::config::Config;
use lora_se::gwmp::{self, PacketType, Rxpk};
use lora_se::lorawan::encoder::FrameBuilder;
use lora_se::lorawan::{JOIN_REQUEST_LEN, MIC_LEN};
use lora_se::se::{api, ConfiguredDriver, FrameContext, KeySelector};

#[derive(Parser)]
#[command(name = "device-sim")]
#[command(about = "Simulated LoRaWAN device sending through a GWMP packet forwarder")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Uplinks to send with the ABP session (needs a [session] section)
    #[arg(long, default_value_t = 0)]
    uplinks: u32,

    /// First uplink frame counter
    #[arg(long, default_value_t = 0)]
    fcnt: u32,

    #[arg(long, default_value_t = 2)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let mut driver = ConfiguredDriver::new();
    config.provision(&mut driver)?;
    api::install(driver)?;

    let gateway_eui = config.forwarder.gateway_eui()?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&config.forwarder.server).await?;
    info!(
        server = %config.forwarder.server,
        gateway_eui = %hex::encode(gateway_eui),
        "Device simulator started"
    );

    let mut token: u16 = api::random_u16()?;

    // Join-request
    let mut request = [0u8; JOIN_REQUEST_LEN];
    let len = api::create_join_request(&mut request, config.device.join_format)?;
    token = token.wrapping_add(1);
    send_uplink(&socket, token, &gateway_eui, &config, &request[..len]).await?;
    info!("Join-request sent: {}", hex::encode(&request[..len]));

    // ABP uplinks
    if args.uplinks > 0 {
        let session = config
            .session
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--uplinks needs a [session] section"))?;
        let dev_addr = session.dev_addr()?;

        for i in 0..args.uplinks {
            sleep(Duration::from_secs(args.interval_secs)).await;

            let fcnt = args.fcnt.wrapping_add(i);
            let payload = fcnt.to_be_bytes().to_vec();
            let message = FrameBuilder::new_uplink(dev_addr, fcnt, 1, payload).build()?;
            let mut phy = vec![0u8; message.bytes.len() + MIC_LEN];
            let len = api::encode_message_with(
                &message.bytes,
                message.payload_offset,
                &mut phy,
                KeySelector::Unicast,
                &FrameContext::new(fcnt),
            )?;

            token = token.wrapping_add(1);
            send_uplink(&socket, token, &gateway_eui, &config, &phy[..len]).await?;
            info!(fcnt, "Uplink sent: {}", hex::encode(&phy[..len]));
        }
    }

    api::reset();
    info!("Simulation complete");
    Ok(())
}

/// Send one PHY payload as PUSH_DATA and wait for its PUSH_ACK
async fn send_uplink(
    socket: &UdpSocket,
    token: u16,
    gateway_eui: &gwmp::GatewayEui,
    config: &Config,
    phy: &[u8],
) -> anyhow::Result<()> {
    let rxpk = Rxpk::lora(
        phy,
        config.forwarder.frequency,
        &config.forwarder.data_rate,
        Utc::now(),
    );
    let datagram = gwmp::push_data(token, gateway_eui, vec![rxpk])?;
    socket.send(&datagram).await?;

    let mut ack_buf = [0u8; 64];
    match timeout(Duration::from_secs(2), socket.recv(&mut ack_buf)).await {
        Ok(Ok(len)) => match gwmp::parse_ack(&ack_buf[..len]) {
            Ok((ack_token, PacketType::PushAck)) if ack_token == token => {
                info!(token, "PUSH_ACK received");
            }
            Ok((ack_token, packet_type)) => {
                warn!(token, ack_token, ?packet_type, "Unexpected acknowledgement");
            }
            Err(e) => warn!("Unexpected response ({} bytes): {}", len, e),
        },
        Ok(Err(e)) => warn!("Recv error: {}", e),
        Err(_) => warn!(token, "No PUSH_ACK (timeout)"),
    }
    Ok(())
}
