use bgxpress::transport::WriteType;
use bgxpress::transport_btleplug::BtleplugTransport;
use bgxpress::{
    BgxEvent, BusMode, ConnectionState, FirmwareImage, OtaStatus, SessionConfig, SessionHandle, SessionRegistry,
};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::ProgressBar;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

type Events = mpsc::UnboundedReceiver<BgxEvent>;

/// Talk to Silicon Labs BGX BLE-to-serial bridges
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE address of the target
    #[arg(short, long, global = true)]
    addr: Option<String>,

    /// Advertised name of the target
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Session configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List BGX devices in range
    Scan {
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
    /// Print device identity and firmware revision
    Info,
    /// Read the bus mode, or set it
    Mode {
        mode: Option<ModeArg>,
        /// Password for remote command mode
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Send text over the serial stream
    Send {
        data: String,
        /// Use acknowledged writes when FastAck is off
        #[arg(long)]
        ack: bool,
    },
    /// Print received serial data until the link drops
    Monitor,
    /// Update the BGX firmware
    Ota {
        image: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        /// Acknowledge every firmware chunk
        #[arg(long)]
        ack: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Stream,
    Local,
    Remote,
}

impl From<ModeArg> for BusMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Stream => BusMode::Stream,
            ModeArg::Local => BusMode::LocalCommand,
            ModeArg::Remote => BusMode::RemoteCommand,
        }
    }
}

const FIND_TIMEOUT: Duration = Duration::from_secs(10);

async fn find_target(registry: &mut SessionRegistry, args: &Args) -> Result<String, Box<dyn Error>> {
    if args.addr.is_none() && args.name.is_none() {
        return Err("either --addr or --name is required".into());
    }
    println!("Searching for {:?} and {:?}...", args.name, args.addr);
    let device = registry
        .find(FIND_TIMEOUT, |device| {
            args.addr
                .as_deref()
                .is_some_and(|addr| device.address.eq_ignore_ascii_case(addr))
                || (args.name.is_some() && device.name == args.name)
        })
        .await?
        .ok_or("no matching BGX device found")?;
    println!("Found [{}] at [{}]", device.name.as_deref().unwrap_or("?"), device.address);
    Ok(device.address)
}

async fn wait_connected(events: &mut Events) -> Result<(), Box<dyn Error>> {
    while let Some(event) = events.recv().await {
        match event {
            BgxEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            } => return Ok(()),
            BgxEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
                ..
            } => return Err("disconnected while connecting".into()),
            BgxEvent::ConnectionError { kind, status, .. } => {
                return Err(format!("connection failed: {:?} ({})", kind, status).into())
            }
            BgxEvent::FirmwareRevision {
                platform, revision, ..
            } => info!("firmware {} on {}", revision, platform),
            BgxEvent::InvalidGattHandles { .. } => {
                return Err("device reported a bad firmware revision; forget and re-pair it".into())
            }
            other => debug!(?other, "event"),
        }
    }
    Err("event stream closed".into())
}

async fn connect(registry: &mut SessionRegistry, args: &Args, events: &mut Events) -> Result<SessionHandle, Box<dyn Error>> {
    let address = find_target(registry, args).await?;
    let handle = registry.connect(&address).await?;
    wait_connected(events).await?;
    println!("Connected to {}", address);
    Ok(handle)
}

async fn device_info(handle: &SessionHandle, events: &mut Events) -> Result<(), Box<dyn Error>> {
    handle.get_device_info().await?;
    while let Some(event) = events.recv().await {
        if let BgxEvent::DeviceInfo {
            device_uuid,
            part_identifier,
            part_id,
            platform,
            ..
        } = event
        {
            println!("device uuid: {}", device_uuid);
            println!("part:        {} ({:?})", part_identifier, part_id);
            println!("platform:    {}", platform.as_deref().unwrap_or("unknown"));
            return Ok(());
        }
    }
    Err("event stream closed".into())
}

async fn mode(
    handle: &SessionHandle,
    events: &mut Events,
    mode: Option<ModeArg>,
    password: Option<String>,
) -> Result<(), Box<dyn Error>> {
    match mode {
        Some(mode) => handle.write_bus_mode(mode.into(), password).await?,
        None => handle.read_bus_mode().await?,
    }
    while let Some(event) = events.recv().await {
        match event {
            BgxEvent::BusModeChanged { mode, .. } => {
                println!("bus mode: {:?}", mode);
                return Ok(());
            }
            BgxEvent::BusModePasswordRequired { .. } => return Err("bus mode password required".into()),
            other => debug!(?other, "event"),
        }
    }
    Err("event stream closed".into())
}

async fn monitor(events: &mut Events) -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Some(BgxEvent::DataReceived { data, .. }) => {
                    stdout.write_all(&data)?;
                    stdout.flush()?;
                }
                Some(BgxEvent::ConnectionStateChanged { state: ConnectionState::Disconnected, .. }) | None => {
                    return Err("link lost".into())
                }
                Some(other) => debug!(?other, "event"),
            },
        }
    }
}

async fn ota(
    handle: &SessionHandle,
    events: &mut Events,
    path: PathBuf,
    password: Option<String>,
    ack: bool,
) -> Result<(), Box<dyn Error>> {
    let bytes = std::fs::read(&path)?;
    info!("image {} crc32 {:08x}", path.display(), crc32fast::hash(&bytes));
    let len = bytes.len();
    let write_type = if ack {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    };
    handle
        .start_ota(FirmwareImage::from_bytes(bytes), password, write_type)
        .await?;

    let bar = ProgressBar::new(len as u64);
    println!("Started OTA upload of {} bytes", len);
    while let Some(event) = events.recv().await {
        match event {
            BgxEvent::OtaProgress { bytes_sent, .. } => bar.set_position(bytes_sent as u64),
            BgxEvent::OtaStatus { status, failed, .. } => match status {
                OtaStatus::Finishing => bar.set_message("finishing"),
                OtaStatus::Finished => {
                    bar.finish();
                    println!("Finished OTA upload of {} bytes", len);
                    return Ok(());
                }
                OtaStatus::PasswordRequired => {
                    bar.abandon();
                    return Err("OTA password required".into());
                }
                _ if failed || status == OtaStatus::UserCanceled => {
                    bar.abandon();
                    return Err(format!("OTA ended: {:?}", status).into());
                }
                _ => {}
            },
            other => debug!(?other, "event"),
        }
    }
    Err("event stream closed".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let transport = Arc::new(BtleplugTransport::new().await?);
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut registry = SessionRegistry::new(transport, config, sink);

    if let Cmd::Scan { seconds } = args.command {
        for device in registry.scan(Duration::from_secs(seconds)).await? {
            println!(
                "{}  {:<24} {}",
                device.address,
                device.name.as_deref().unwrap_or(""),
                device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_default()
            );
        }
        return Ok(());
    }

    let handle = connect(&mut registry, &args, &mut events).await?;
    let result = match args.command {
        Cmd::Scan { .. } => Ok(()),
        Cmd::Info => device_info(&handle, &mut events).await,
        Cmd::Mode { mode: m, password } => mode(&handle, &mut events, m, password).await,
        Cmd::Send { data, ack } => {
            handle.set_acknowledged_writes(ack).await?;
            handle.write_serial(data.as_bytes()).await?;
            handle.wait_until_idle().await?;
            println!("Sent {} bytes", data.len());
            Ok(())
        }
        Cmd::Monitor => monitor(&mut events).await,
        Cmd::Ota { image, password, ack } => ota(&handle, &mut events, image, password, ack).await,
    };

    handle.disconnect().await?;
    handle
        .wait_for_state(|state| state == ConnectionState::Disconnected)
        .await?;
    result
}
