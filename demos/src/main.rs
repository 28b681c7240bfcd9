//! Joins a handful of channels and logs everything the fleet forwards,
//! re-joining any channel that comes back on the orphan stream.
//!
//! To run this example, set TWITCH_USERNAME, TWITCH_AUTH and (optionally,
//! comma-separated) TWITCH_CHANNELS.

#[macro_use]
extern crate log;

use std::env;
use std::error::Error;
use std::sync::Arc;

use tmi_fleet::{FleetConfigBuilder, Manager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let channels: Vec<String> = env::var("TWITCH_CHANNELS")
        .unwrap_or_else(|_| "forsen".to_owned())
        .split(',')
        .map(|s| s.trim().to_owned())
        .collect();

    let config = FleetConfigBuilder::for_user(env::var("TWITCH_USERNAME")?, env::var("TWITCH_AUTH")?).build()?;

    let manager = Manager::new(
        config,
        Arc::new(tmi_fleet::RateLimiter::new(
            Arc::new(tmi_fleet::NoopStore::default()),
            "twitch-irc-join-ratelimit",
            "twitch-irc-auth-ratelimit",
            20,
            20,
            std::time::Duration::from_secs(60),
        )),
        Arc::new(|_key, msg| {
            info!("{:?}: {}", msg.kind(), msg.raw());
        }),
    );

    let mut orphans = manager.orphan_receiver();
    let gc_manager = manager.clone();
    tokio::spawn(gc_manager.run_gc());

    for channel in &channels {
        manager.join(channel, 1).await?;
        info!("joined {}", channel);
    }

    let orphan_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(name) = orphans.recv().await {
            warn!("{} orphaned, re-joining", name);
            if let Err(e) = orphan_manager.join(&name, 1).await {
                error!("failed to re-join {}: {}", name, e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown().await.wait().await;
    Ok(())
}
