//! Command-line client for line oriented field devices

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use fieldlink::*;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("unable to read {0}: {1}")]
    ReadConfig(PathBuf, std::io::Error),
    #[error("bad configuration file: {0}")]
    BadConfig(#[from] toml::de::Error),
    #[error("no link given on the command line or in the configuration file")]
    NoLink,
    #[error("bad hex payload: {0}")]
    BadHex(String),
    #[error("bad serial setting: {0}")]
    BadSerialSetting(String),
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Parser)]
#[command(name = "fieldlink-client")]
#[command(about = "A command line program for sending requests to field devices using the fieldlink crate")]
#[command(version)]
struct Cli {
    #[arg(short = 'c', long, help = "Optional TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(short = 'u', long, default_value = "1", help = "The unit id of the device")]
    unit: u8,

    #[arg(short = 'r', long, help = "The request payload")]
    request: String,

    #[arg(long, help = "Interpret the request as hex bytes (e.g. 01A3FF)")]
    hex: bool,

    #[arg(short = 't', long, default_value = "1000", help = "Response timeout in milliseconds")]
    timeout: u64,

    #[arg(long, default_value = "2", help = "Number of retries after a transport failure")]
    retries: u32,

    #[arg(short = 'p', long, help = "Optional polling period in milliseconds")]
    period: Option<u64>,

    #[command(subcommand)]
    link: Option<LinkCommand>,
}

#[derive(Subcommand)]
enum LinkCommand {
    #[command(about = "talk to a device over TCP")]
    Tcp(TcpArgs),
    #[command(about = "talk to a device on a serial line")]
    Serial(SerialArgs),
}

#[derive(Args)]
struct TcpArgs {
    #[arg(long, default_value = "127.0.0.1", help = "Host name or IP address")]
    host: String,

    #[arg(long, default_value = "4001", help = "TCP port")]
    port: u16,
}

#[derive(Args)]
struct SerialArgs {
    #[arg(long, help = "Path of the serial device")]
    path: String,

    #[arg(short = 'b', long, default_value = "9600", help = "Baud rate")]
    baud: u32,

    #[arg(long, default_value = "8", help = "Data bits (5, 6, 7, 8)")]
    data_bits: u8,

    #[arg(long, default_value = "none", help = "Parity (none, odd, even)")]
    parity: String,

    #[arg(long, default_value = "1", help = "Stop bits (1, 2)")]
    stop_bits: u8,
}

/// Contents of the optional configuration file
#[derive(Default, Deserialize)]
#[serde(default)]
struct ClientConfig {
    transport: TransportConfig,
    link: Option<LinkConfig>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ClientConfig::default(),
    };

    let link = match &cli.link {
        Some(LinkCommand::Tcp(args)) => Link::tcp(args.host.clone(), args.port),
        Some(LinkCommand::Serial(args)) => Link::serial(args.path.clone(), serial_settings(args)?),
        None => config.link.clone().ok_or(Error::NoLink)?.into(),
    };

    let payload = if cli.hex {
        parse_hex(&cli.request)?
    } else {
        cli.request.clone().into_bytes()
    };

    let manager = TransportManager::new(
        config.transport.clone(),
        DefaultConnectionFactory::new(config.transport.connect_timeout),
        DelimitedCodec::default(),
    );
    let channel = manager.channel(&link.unit(UnitId::new(cli.unit)));
    let param = RequestParam::new(Duration::from_millis(cli.timeout), cli.retries)
        .with_default_deadline();

    match cli.period {
        None => {
            let response = channel.submit(payload, param).await?;
            print_response(&response, cli.hex);
            Ok(())
        }
        Some(period_ms) => poll(&channel, payload, param, period_ms, cli.hex).await,
    }
}

async fn poll(
    channel: &Channel,
    payload: Vec<u8>,
    param: RequestParam,
    period_ms: u64,
    hex: bool,
) -> Result<(), Error> {
    let (listener, mut rx) = ChannelListener::create(16);
    let handle = channel.register_poll(
        move || payload.clone(),
        Duration::from_millis(period_ms),
        param,
        Box::new(listener),
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("stopping after {} skipped poll(s)", handle.skipped());
                return Ok(());
            }
            result = rx.recv() => match result {
                Some(Ok(response)) => print_response(&response, hex),
                Some(Err(RequestError::Disposed)) | None => return Err(RequestError::Disposed.into()),
                Some(Err(err)) => tracing::warn!("poll failed: {}", err),
            }
        }
    }
}

fn load_config(path: &Path) -> Result<ClientConfig, Error> {
    let text =
        std::fs::read_to_string(path).map_err(|err| Error::ReadConfig(path.to_path_buf(), err))?;
    Ok(toml::from_str(&text)?)
}

fn serial_settings(args: &SerialArgs) -> Result<SerialSettings, Error> {
    let data_bits = match args.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        8 => DataBits::Eight,
        x => return Err(Error::BadSerialSetting(format!("data bits: {x}"))),
    };
    let parity = match args.parity.to_ascii_lowercase().as_str() {
        "none" | "n" => Parity::None,
        "odd" | "o" => Parity::Odd,
        "even" | "e" => Parity::Even,
        x => return Err(Error::BadSerialSetting(format!("parity: {x}"))),
    };
    let stop_bits = match args.stop_bits {
        1 => StopBits::One,
        2 => StopBits::Two,
        x => return Err(Error::BadSerialSetting(format!("stop bits: {x}"))),
    };

    Ok(SerialSettings {
        baud_rate: args.baud,
        data_bits,
        parity,
        stop_bits,
        ..SerialSettings::default()
    })
}

fn parse_hex(text: &str) -> Result<Vec<u8>, Error> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(Error::BadHex(text.to_string()));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|_| Error::BadHex(text.to_string()))
        })
        .collect()
}

fn print_response(response: &[u8], hex: bool) {
    if hex {
        let text: Vec<String> = response.iter().map(|b| format!("{b:02X}")).collect();
        println!("{}", text.join(" "));
    } else {
        println!("{}", String::from_utf8_lossy(response));
    }
}
