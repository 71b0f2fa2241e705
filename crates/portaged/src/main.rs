//! portaged — Portage transfer daemon.
//!
//! Serves peer requests for validated files and content-store entries
//! over UDP. One socket, one heartbeat, one engine, all driven from a
//! single task so the engine's single-logical-thread contract holds.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use portage_core::config::PortageConfig;
use portage_engine::{ContentStore, XferManager};

mod adapter;

use adapter::{decode, Frame, UdpLink};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = PortageConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PortageConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PortageConfig::default()
    });

    std::fs::create_dir_all(&config.storage.inbox_path).with_context(|| {
        format!(
            "failed to create inbox: {}",
            config.storage.inbox_path.display()
        )
    })?;

    let store = ContentStore::new(&config.storage.store_path)?;
    tracing::info!(
        root = %config.storage.store_path.display(),
        entries = store.count(),
        "content store ready"
    );

    let socket = UdpSocket::bind(&config.network.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.bind_addr))?;
    tracing::info!(addr = %socket.local_addr()?, "portaged listening");

    let mut manager = XferManager::new(&config);
    manager.set_store(store);

    let mut link = UdpLink::new(Duration::from_secs(config.network.peer_ttl_secs));
    let mut tick = tokio::time::interval(Duration::from_millis(config.network.tick_interval_ms));
    let mut census = tokio::time::interval(Duration::from_secs(10));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }

            _ = tick.tick() => {
                let now = Instant::now();
                link.set_now(now);
                manager.tick(&mut link, now);
                flush(&socket, &mut link).await;
            }

            _ = census.tick() => {
                let counts = manager.counts();
                tracing::info!(
                    send_active = counts.send_active,
                    send_pending = counts.send_pending,
                    send_registered = counts.send_registered,
                    recv_active = counts.recv_active,
                    recv_pending = counts.recv_pending,
                    "transfer census"
                );
            }

            recv = socket.recv_from(&mut buf) => {
                let (len, from) = match recv {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "socket receive failed");
                        continue;
                    }
                };
                let now = Instant::now();
                link.heard_from(from, now);
                match decode(&buf[..len]) {
                    Ok(Frame::Request { id, target, large }) => {
                        manager.on_request(&mut link, from, id, target, large, now);
                    }
                    Ok(Frame::Data { id, packet, payload }) => {
                        manager.on_chunk(&mut link, from, id, packet, &payload, now);
                    }
                    Ok(Frame::Ack { id, seq }) => {
                        manager.on_ack(&mut link, from, id, seq, now);
                    }
                    Ok(Frame::Abort { id, code }) => {
                        manager.on_abort(&mut link, from, id, code, now);
                    }
                    Err(e) => {
                        tracing::debug!(peer = %from, error = %e, "undecodable datagram");
                    }
                }
                flush(&socket, &mut link).await;
            }
        }
    }
}

/// Transmit everything the engine queued during the last call.
async fn flush(socket: &UdpSocket, link: &mut UdpLink) {
    for (to, datagram) in link.drain() {
        if let Err(e) = socket.send_to(&datagram, to).await {
            tracing::warn!(peer = %to, error = %e, "datagram send failed");
        }
    }
}
