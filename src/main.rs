//! veilgate: SOCKS5 / HTTP-CONNECT client and Trojan server
//!
//! Client mode: local mixed SOCKS5/HTTP listener, rule-based routing,
//! Trojan (TLS) upstream, optional UDP relay client.
//! Server mode: Trojan listener with decoy fallback, direct outbound,
//! optional UDP relay server.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;

use veilgate::config::{CliArgs, ConnConfig, Mode};
use veilgate::core::{Adapter, Address, FixedMatch, InboundServer, Match, StaticHook};
use veilgate::dispatch::{ClientDispatcher, ServerDispatcher};
use veilgate::logger::{self, log, LogLevel};
use veilgate::nat::{RelayMode, UdpRelayClient, UdpRelayServer};
use veilgate::outbound::{DirectDialer, Dialer};
use veilgate::rules::RuleFilter;
use veilgate::socks::SocksServer;
use veilgate::transport::tls;
use veilgate::trojan::{TrojanDialer, TrojanServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    // This must be done before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(LogLevel::parse(&cli.log_mode));

    let conn_config = ConnConfig::from_cli(&cli);
    log::info!(mode = ?cli.mode, listen = %cli.listen, "Starting veilgate");

    match cli.mode {
        Mode::Client => run_client(&cli, conn_config).await,
        Mode::Server => run_server(&cli, conn_config).await,
    }
}

fn direct_dialer(conn_config: &ConnConfig) -> Arc<DirectDialer> {
    Arc::new(
        DirectDialer::new(conn_config.connect_timeout, conn_config.udp_timeout)
            .with_nodelay(conn_config.tcp_nodelay),
    )
}

async fn run_client(cli: &CliArgs, conn_config: ConnConfig) -> Result<()> {
    let remote = Address::parse(cli.remote.as_deref().unwrap_or_default())?;
    let password = cli
        .password_hashes()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no usable password"))?;

    let mut trojan = TrojanDialer::new(remote.clone(), password, conn_config.connect_timeout)?;
    if cli.no_tls {
        log::warn!(remote = %remote, "TLS disabled for the remote server");
    } else {
        let tls_config = tls::load_client_config(cli.ca_file.as_deref())?;
        let sni = cli.server_name().unwrap_or_else(|| remote.host());
        trojan = trojan.with_tls(tls_config, &sni, conn_config.tls_handshake_timeout)?;
    }

    let matcher: Arc<dyn Match> = match &cli.rules_file {
        Some(path) => Arc::new(RuleFilter::from_file(path)?),
        None => Arc::new(FixedMatch::new(Adapter::Proxy)),
    };

    let inbound = Arc::new(
        SocksServer::bind(cli.listen, conn_config)
            .with_context(|| format!("failed to bind {}", cli.listen))?,
    );
    let dispatcher = Arc::new(ClientDispatcher::new(
        Arc::clone(&inbound) as Arc<dyn InboundServer>,
        matcher,
        direct_dialer(&conn_config) as Arc<dyn Dialer>,
        Arc::new(trojan) as Arc<dyn Dialer>,
        conn_config,
    ));

    let relay = match (cli.udp_relay_listen, cli.udp_relay_server.as_deref()) {
        (Some(listen), Some(server)) => {
            let mode = match cli.udp_tunnel_target.as_deref() {
                Some(target) => RelayMode::Tunnel(Address::parse(target)?),
                None => RelayMode::Socks,
            };
            let server = Address::parse(server)?;
            Some(Arc::new(
                UdpRelayClient::bind(listen, &server, mode, conn_config.nat_timeout).await?,
            ))
        }
        _ => None,
    };

    let serve = {
        let inbound = Arc::clone(&inbound);
        let dispatcher = Arc::clone(&dispatcher);
        let relay = relay.clone();
        async move {
            let relay_task = async {
                match relay {
                    Some(relay) => relay.serve().await,
                    None => std::future::pending().await,
                }
            };
            tokio::try_join!(inbound.listen_and_serve(), dispatcher.run(), relay_task)?;
            Ok::<(), anyhow::Error>(())
        }
    };

    run_until_shutdown(serve).await;
    dispatcher.close();
    if let Some(relay) = relay {
        relay.close();
    }
    Ok(())
}

async fn run_server(cli: &CliArgs, conn_config: ConnConfig) -> Result<()> {
    let direct = direct_dialer(&conn_config);
    let hook = StaticHook::new(cli.password_hashes(), Arc::clone(&direct) as Arc<dyn Dialer>);
    log::info!(users = hook.len(), "passwords loaded");

    let mut builder = TrojanServer::builder()
        .hook(Arc::new(hook))
        .max_decoy_sessions(cli.max_decoy_sessions)
        .conn_config(conn_config);
    if let (Some(cert), Some(key)) = (&cli.cert_file, &cli.key_file) {
        builder = builder.tls(tls::load_server_config(cert, key)?);
    } else {
        log::warn!("no certificate given, serving Trojan without TLS");
    }
    if let Some(front) = &cli.front {
        builder = builder.front(Address::parse(front)?);
    }
    let inbound = Arc::new(
        builder
            .bind(cli.listen)
            .with_context(|| format!("failed to bind {}", cli.listen))?,
    );

    let dispatcher = Arc::new(ServerDispatcher::new(
        Arc::clone(&inbound) as Arc<dyn InboundServer>,
        direct as Arc<dyn Dialer>,
        conn_config,
    ));

    let relay = match cli.udp_relay_listen {
        Some(listen) => Some(Arc::new(UdpRelayServer::bind(listen, conn_config.nat_timeout)?)),
        None => None,
    };

    let serve = {
        let inbound = Arc::clone(&inbound);
        let dispatcher = Arc::clone(&dispatcher);
        let relay = relay.clone();
        async move {
            let relay_task = async {
                match relay {
                    Some(relay) => relay.serve().await,
                    None => std::future::pending().await,
                }
            };
            tokio::try_join!(inbound.listen_and_serve(), dispatcher.run(), relay_task)?;
            Ok::<(), anyhow::Error>(())
        }
    };

    run_until_shutdown(serve).await;
    dispatcher.close();
    if let Some(relay) = relay {
        relay.close();
    }
    Ok(())
}

/// Drive `serve` until it finishes or a shutdown signal arrives
async fn run_until_shutdown<F>(serve: F)
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        res = serve => {
            if let Err(e) = res {
                log::error!(error = %e, "server stopped");
            }
        }
        _ = shutdown_signal() => {}
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            log::warn!("failed to install signal handlers, falling back to ctrl-c");
            tokio::signal::ctrl_c().await.ok();
            return;
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }
}
