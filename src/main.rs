//! dnspipe - TCP-over-DNS tunnel.
//!
//! `dnspipe client` runs the HTTP proxy that pushes traffic into the tunnel;
//! `dnspipe server` runs the authoritative DNS daemon that pulls it back out.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dnspipe::{
    Carrier, DnsDaemon, DnsRelay, HttpProxy, Initiator, InitiatorConfig, ResponderConfig,
    ServerConfig, TotpSecret,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Loopback address the client-side listeners default to.
const CLIENT_BIND_IP: &str = "127.0.0.12";

#[derive(Parser)]
#[command(name = "dnspipe")]
#[command(version = VERSION)]
#[command(about = "TCP-over-DNS tunnel", long_about = None)]
struct Cli {
    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP proxy client (tunnel initiator)
    Client {
        /// Local proxy port
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Authoritative domain of the tunnel
        #[arg(long)]
        dns_name: String,

        /// Shared OTP secret, base32
        #[arg(long, env = "DNSPIPE_OTP_SECRET")]
        otp_secret: String,

        /// Recursive resolver address
        #[arg(long, default_value = "1.1.1.1:53")]
        resolver: SocketAddr,

        /// Carry downstream segments in TXT answers instead of CNAME
        #[arg(long)]
        enable_txt: bool,

        /// Override the per-query payload size
        #[arg(long)]
        upstream_seg_len: Option<usize>,

        /// Override the per-answer payload size
        #[arg(long)]
        downstream_seg_len: Option<usize>,

        /// Also answer plain DNS lookups on port 53 through the tunnel
        #[arg(long)]
        enable_dns_relay: bool,

        /// How long to wait for the responder during tunnel setup
        #[arg(long, default_value = "20s", value_parser = humantime::parse_duration)]
        handshake_timeout: std::time::Duration,
    },

    /// Run the authoritative DNS daemon (tunnel responder)
    Server {
        /// Configuration file (TOML); flags override its values
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Bind address for the DNS daemon
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Authoritative domain of the tunnel
        #[arg(long)]
        dns_name: Option<String>,

        /// Shared OTP secret, base32
        #[arg(long, env = "DNSPIPE_OTP_SECRET")]
        otp_secret: Option<String>,

        /// Cap on the per-answer payload size
        #[arg(long)]
        downstream_seg_len: Option<usize>,

        /// Upstream resolver for relayed lookups
        #[arg(long)]
        relay_upstream: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if cli.verbose >= 3 {
        logger.filter_module("dnspipe", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    match cli.command {
        Commands::Client {
            port,
            dns_name,
            otp_secret,
            resolver,
            enable_txt,
            upstream_seg_len,
            downstream_seg_len,
            enable_dns_relay,
            handshake_timeout,
        } => {
            run_client(
                port,
                dns_name,
                &otp_secret,
                resolver,
                enable_txt,
                upstream_seg_len,
                downstream_seg_len,
                enable_dns_relay,
                handshake_timeout,
            )
            .await
        }
        Commands::Server {
            config,
            listen,
            dns_name,
            otp_secret,
            downstream_seg_len,
            relay_upstream,
        } => {
            run_server(
                config,
                listen,
                dns_name,
                otp_secret,
                downstream_seg_len,
                relay_upstream,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    port: u16,
    dns_name: String,
    otp_secret: &str,
    resolver: SocketAddr,
    enable_txt: bool,
    upstream_seg_len: Option<usize>,
    downstream_seg_len: Option<usize>,
    enable_dns_relay: bool,
    handshake_timeout: std::time::Duration,
) -> Result<()> {
    let otp = TotpSecret::from_base32(otp_secret).context("parsing OTP secret")?;
    let bind_ip: IpAddr = CLIENT_BIND_IP.parse().context("client bind address")?;

    let mut cfg = InitiatorConfig::new(resolver, dns_name, otp);
    cfg.carrier = if enable_txt {
        Carrier::Txt
    } else {
        Carrier::Cname
    };
    cfg.upstream_seg_len = upstream_seg_len;
    cfg.downstream_seg_len = downstream_seg_len;
    cfg.handshake_timeout = handshake_timeout;
    let initiator = Initiator::new(cfg);

    log::info!(
        "tunnel capacities: {} bytes/query up, {} bytes/answer down",
        initiator.upstream_capacity(),
        initiator.downstream_capacity()
    );

    let lockdown = Arc::new(AtomicBool::new(false));

    if enable_dns_relay {
        let relay_initiator = Arc::clone(&initiator);
        let relay_lockdown = Arc::clone(&lockdown);
        tokio::spawn(async move {
            dnspipe::supervisor::supervise("dns-relay", relay_lockdown, move || {
                let initiator = Arc::clone(&relay_initiator);
                async move {
                    let relay =
                        DnsRelay::bind(SocketAddr::new(bind_ip, 53), initiator).await?;
                    relay.run().await?;
                    Ok(())
                }
            })
            .await;
        });
    }

    let proxy_initiator = Arc::clone(&initiator);
    let proxy_addr = SocketAddr::new(bind_ip, port);
    // Fail fast if the port cannot be bound at all.
    let proxy = HttpProxy::bind(proxy_addr, Arc::clone(&proxy_initiator))
        .await
        .with_context(|| format!("binding HTTP proxy on {proxy_addr}"))?;
    drop(proxy);

    dnspipe::supervisor::supervise("http-proxy", lockdown, move || {
        let initiator = Arc::clone(&proxy_initiator);
        async move {
            let proxy = HttpProxy::bind(proxy_addr, initiator).await?;
            proxy.run().await?;
            Ok(())
        }
    })
    .await;
    Ok(())
}

async fn run_server(
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    dns_name: Option<String>,
    otp_secret: Option<String>,
    downstream_seg_len: Option<usize>,
    relay_upstream: Option<SocketAddr>,
) -> Result<()> {
    let file = match config {
        Some(path) => {
            Some(ServerConfig::load(&path).with_context(|| format!("loading {}", path.display()))?)
        }
        None => None,
    };

    let dns_name = dns_name
        .or_else(|| file.as_ref().map(|f| f.dns_name.clone()))
        .context("--dns-name or a config file is required")?;
    let otp_secret = otp_secret
        .or_else(|| file.as_ref().map(|f| f.otp_secret.clone()))
        .context("--otp-secret or a config file is required")?;
    let otp = TotpSecret::from_base32(&otp_secret).context("parsing OTP secret")?;

    let listen = listen
        .or(file.as_ref().map(|f| f.listen))
        .unwrap_or("0.0.0.0:53".parse()?);
    let lockdown = Arc::new(AtomicBool::new(
        file.as_ref().map(|f| f.lockdown).unwrap_or(false),
    ));

    let mut cfg = ResponderConfig::new(listen, dns_name, otp);
    cfg.downstream_seg_len = downstream_seg_len.or(file.as_ref().and_then(|f| f.downstream_seg_len));
    if let Some(upstream) = relay_upstream.or(file.as_ref().map(|f| f.relay_upstream)) {
        cfg.relay_upstream = upstream;
    }
    if let Some(file) = &file {
        cfg.tc = file.timing.to_tc_config();
    }

    // Surface bind errors before entering the supervisor.
    let probe = DnsDaemon::bind(cfg.clone()).await?;
    drop(probe);

    dnspipe::supervisor::supervise("dns-daemon", lockdown, move || {
        let cfg = cfg.clone();
        async move {
            let daemon = Arc::new(DnsDaemon::bind(cfg).await?);
            daemon.run().await?;
            Ok(())
        }
    })
    .await;
    Ok(())
}
