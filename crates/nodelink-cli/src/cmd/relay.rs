//! `nodelink relay`: run an uplink relay until Ctrl+C.

use crate::ui;
use anyhow::Context;
use nodelink_types::config::{load_config, UnknownMessagePolicy};
use nodelink_uplink::{UplinkRelayService, UplinkServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Used when neither `--listen` nor `uplink.listen_addr` is set.
const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:31005";

pub fn cmd_relay(config: Option<PathBuf>, listen: Option<String>, echo: bool) -> anyhow::Result<()> {
    let mut uplink = load_config(config.as_deref()).uplink;
    if echo {
        uplink.unknown_message_policy = UnknownMessagePolicy::Echo;
    }
    let addr = listen
        .or_else(|| uplink.listen_addr.clone())
        .unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string());

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async move {
        let relay = Arc::new(UplinkRelayService::new(&uplink));
        let server = UplinkServer::bind(&addr, Arc::clone(&relay), uplink)
            .await
            .with_context(|| format!("Failed to listen on {addr}"))?;

        ui::section("nodelink uplink relay");
        ui::kv_ok("Listening", &server.local_addr().to_string());
        ui::blank();
        ui::hint("press Ctrl+C to stop");

        let (stop_tx, stop_rx) = watch::channel(false);
        let serving = tokio::spawn(server.run(stop_rx));
        super::shutdown_signal().await;
        let _ = stop_tx.send(true);
        serving.await.context("Relay task failed")?;

        ui::success(&format!(
            "relay stopped ({} sessions still active)",
            relay.active_session_count()
        ));
        Ok(())
    })
}
