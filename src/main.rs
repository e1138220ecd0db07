//! Live packet viewer for an EzProxy spawner
//!
//! Prints the key, spawner and proxy state, then opens a control channel and
//! logs every packet until interrupted or until the channel dies.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;

use ezproxy_client::business::api::{KeyInfo, ProxyStatus, SpawnerStatus};
use ezproxy_client::config::CliArgs;
use ezproxy_client::logger::{self, log};
use ezproxy_client::{
    ApiClient, ChannelHandle, Interceptor, Packet, ProxyId, Session, SessionFactory, SessionHub,
};

/// Per-proxy packet counter deciding the viewer's verdicts
struct ViewSession {
    proxy_id: ProxyId,
    drop_every: u64,
    filterable: u64,
    seen: u64,
}

impl Session for ViewSession {
    fn handle_packet(&mut self, channel: &ChannelHandle, packet: &Packet) -> anyhow::Result<bool> {
        self.seen += 1;
        log::info!(
            "[{} => {}{}] {{{}}} {} bytes",
            packet.source,
            packet.dest,
            if packet.is_injected() { " (Injected)" } else { "" },
            packet.pkt_num,
            packet.data.len()
        );

        if !channel.capabilities().filter || packet.is_injected() {
            return Ok(true);
        }
        self.filterable += 1;
        let allow = self.drop_every == 0 || self.filterable % self.drop_every != 0;
        if !allow {
            log::debug!(proxy_id = self.proxy_id, pkt_num = packet.pkt_num, "Dropping packet");
        }
        Ok(allow)
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn close(&mut self) {
        log::info!(proxy_id = self.proxy_id, packets = self.seen, "Proxy session closed");
    }
}

struct ViewFactory {
    drop_every: u64,
}

impl SessionFactory for ViewFactory {
    type Session = ViewSession;

    fn create(&self, _: &ChannelHandle, packet: &Packet) -> anyhow::Result<ViewSession> {
        log::info!(proxy_id = packet.proxy_id, network = %packet.network, "New proxy seen");
        Ok(ViewSession {
            proxy_id: packet.proxy_id,
            drop_every: self.drop_every,
            filterable: 0,
            seen: 0,
        })
    }
}

fn print_key_info(info: &KeyInfo) {
    println!("* Key Info");
    println!("|  Value           : {}", info.value);
    println!("|  CanCheckStatus  : {}", info.can_check_status);
    println!("|  CanClose        : {}", info.can_close);
    println!("|  CanUseWebsocket : {}", info.can_use_websocket);
    println!("|  CanFilter       : {}", info.can_filter);
    println!("|  CanInject       : {}", info.can_inject);
    println!("|  CanMakeKeys     : {}", info.can_make_keys);
    println!("|  CanDuplicateKeys: {}", info.can_duplicate_keys);
    println!("|  Admin           : {}", info.admin);
}

fn print_status(status: &SpawnerStatus) {
    println!("* SpawnerStatus");
    println!("|  ConnectionCount: {}", status.connection_count);
    println!("|  Alive          : {}", status.alive);
    println!("|  BytesSent      : {}", status.bytes_sent);
    println!("|  ServerAddress  : {}", status.server_address);
    for (name, addr) in &status.mpx_addresses {
        println!("|  Mpx[{}]: {}", name, addr);
    }
}

fn print_proxies(proxies: &[ProxyStatus]) {
    println!("* ProxyList ({} elements)", proxies.len());
    for (i, p) in proxies.iter().enumerate() {
        println!("| [{}]", i);
        println!("  |  Id            : {}", p.id);
        println!("  |  Alive         : {}", p.alive);
        println!("  |  Address       : {}", p.address);
        println!("  |  Network       : {}", p.network);
        println!("  |  BytesSent     : {}", p.bytes_sent);
        println!("  |  LastContactAgo: {:?}", p.last_contact());
    }
}

async fn print_overview(api: &ApiClient) -> Result<()> {
    print_key_info(&api.key_info(None).await?);

    // Keys without CheckStatus still get to view packets
    match api.status().await {
        Ok(status) => print_status(&status),
        Err(e) => log::warn!(error = %e, "Spawner status unavailable"),
    }
    match api.list_proxies().await {
        Ok(proxies) => print_proxies(&proxies),
        Err(e) => log::warn!(error = %e, "Proxy list unavailable"),
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

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
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(cli.log_level());

    let config = cli.to_client_config();
    let caps = cli.to_capabilities()?;
    log::info!(
        url = %config.base_url,
        filter = caps.filter,
        inject = caps.inject,
        close = caps.close,
        drop_every = cli.drop_every,
        "Starting EzProxy viewer"
    );

    // Unfiltered packets and failed sessions pass through untouched
    let hub = SessionHub::new(ViewFactory {
        drop_every: cli.drop_every,
    })
    .with_fallback(true);
    let mut interceptor = Interceptor::new(config.clone(), hub)?;

    if let Err(e) = print_overview(interceptor.api()).await {
        interceptor.shutdown(config.shutdown_timeout).await;
        return Err(e);
    }

    let mut channel = match interceptor.open_channel(caps).await {
        Ok(channel) => channel,
        Err(e) => {
            interceptor.shutdown(config.shutdown_timeout).await;
            return Err(e.into());
        }
    };

    let closer = channel.handle().clone();
    let outcome = tokio::select! {
        res = channel.join() => res,
        res = shutdown_signal() => {
            if let Err(e) = res {
                log::warn!(error = %e, "Signal handler failed");
            }
            closer.close();
            Ok(())
        }
    };

    if channel.join_timeout(config.shutdown_timeout).await.is_none() {
        log::warn!("Channel did not close in time");
    }
    interceptor.shutdown(config.shutdown_timeout).await;

    match outcome {
        Ok(()) => {
            log::info!("Viewer stopped");
            Ok(())
        }
        Err(e) => {
            log::error!(error = %e, "Channel failed");
            Err(e.into())
        }
    }
}
