use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "TCP broadcast relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default config file (never overwrites an existing one).
    Init {
        /// Config file path (default: RELAY_CONFIG_PATH or ./config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the relay. This is also what runs when no subcommand is given.
    Serve {
        /// Config file path (default: RELAY_CONFIG_PATH or ./config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// TCP port (default from config, RELAY_PORT, or 5500)
        #[arg(long, short)]
        port: Option<u16>,

        /// Bind address (default from config, RELAY_BIND, or 0.0.0.0)
        #[arg(long, short)]
        bind: Option<String>,
    },

    /// Connect to a relay: stdin lines are sent, everything received is printed.
    Connect {
        /// Relay address (default: 127.0.0.1 and the configured port)
        #[arg(value_name = "ADDR")]
        addr: Option<String>,

        /// Config file path, used for the default port
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port, bind }) => {
            if let Err(e) = run_serve(config, port, bind).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Connect { addr, config }) => {
            if let Err(e) = run_connect(addr, config).await {
                log::error!("connect failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = run_serve(None, None, None).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(relay::config::default_config_path);
    if relay::init::init_config(&path)? {
        println!("wrote default config to {}", path.display());
    } else {
        println!("config already exists at {}", path.display());
    }
    Ok(())
}

async fn run_serve(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = relay::config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    if let Some(b) = bind {
        config.relay.bind = b;
    }
    log::debug!("using config from {}", path.display());
    log::info!("starting relay on {}", config.relay.addr());
    relay::run_relay(config).await
}

async fn run_connect(addr: Option<String>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let addr = match addr {
        Some(a) => a,
        None => {
            let (config, _) = relay::config::load_config(config_path)?;
            format!("127.0.0.1:{}", config.relay.port)
        }
    };
    let stream = connect(&addr).await?;
    log::info!("connected to {}", addr);
    let (reader, mut writer) = stream.into_split();

    let mut incoming = tokio::spawn(async move {
        if let Err(e) = copy_incoming(reader, tokio::io::stdout()).await {
            log::warn!("relay connection: {}", e);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut incoming => {
                log::info!("relay closed the connection");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
    }

    let _ = writer.shutdown().await;
    incoming.abort();
    Ok(())
}

async fn connect(addr: &str) -> anyhow::Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {}", addr))
}

/// Copy relayed bytes to `out` unchanged; a UTF-8 character split across reads stays intact.
async fn copy_incoming<R, W>(mut reader: R, mut out: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        out.write_all(&buf[..n]).await?;
        out.flush().await?;
    }
}
