//! `nodelink uplink-probe`: connect to a relay, report what it announces,
//! then disconnect.

use crate::ui;
use anyhow::Context;
use nodelink_uplink::{
    ClientSessionEventHandler, ClientSessionParameters, ClientSideUplinkSession,
    ToolDescriptorListUpdate, UplinkErrorType,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps the latest tool list per destination.
#[derive(Default)]
struct AnnouncementCollector {
    destinations: Mutex<BTreeMap<String, ToolDescriptorListUpdate>>,
}

impl AnnouncementCollector {
    fn snapshot(&self) -> Vec<ToolDescriptorListUpdate> {
        self.destinations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl ClientSessionEventHandler for AnnouncementCollector {
    fn on_tool_descriptor_list_update(&self, update: ToolDescriptorListUpdate) {
        let mut destinations = self.destinations.lock().unwrap_or_else(|e| e.into_inner());
        if update.is_retraction() {
            destinations.remove(&update.destination_id);
        } else {
            destinations.insert(update.destination_id.clone(), update);
        }
    }

    fn on_fatal_session_error(&self, error_type: UplinkErrorType, message: &str) {
        tracing::warn!(error_type = error_type.code(), reason = message, "Uplink: session error");
    }
}

pub fn cmd_uplink_probe(
    relay: &str,
    account: &str,
    qualifier: Option<String>,
    listen_ms: u64,
    json: bool,
) -> anyhow::Result<()> {
    let mut params = ClientSessionParameters::new(account);
    params.session_qualifier = qualifier;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async move {
        let collector = Arc::new(AnnouncementCollector::default());
        let session = ClientSideUplinkSession::connect_tcp(relay, params, collector.clone(), None)
            .await
            .with_context(|| format!("Failed to open an uplink session to {relay}"))?;

        tokio::time::sleep(Duration::from_millis(listen_ms)).await;
        let announcements = collector.snapshot();
        session.close().await;
        let end_state = session.wait_terminated(Duration::from_secs(5)).await;

        if json {
            let destinations: Vec<_> = announcements
                .iter()
                .map(|u| {
                    serde_json::json!({
                        "destination_id": u.destination_id,
                        "display_name": u.display_name,
                        "tools": u.tool_descriptors.iter().map(|t| &t.tool_id).collect::<Vec<_>>(),
                    })
                })
                .collect();
            let body = serde_json::json!({
                "relay": relay,
                "namespace": session.namespace_id(),
                "destinations": destinations,
                "end_state": end_state.map(|s| s.to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            return Ok(());
        }

        ui::section("Uplink session");
        ui::kv("Relay", relay);
        ui::kv_ok("Namespace", session.namespace_id());
        ui::kv("Session", session.local_session_id());
        ui::blank();
        if announcements.is_empty() {
            ui::hint("no tools announced by other clients");
        } else {
            ui::section("Announced tools");
            for update in &announcements {
                println!("    {} ({})", update.display_name, update.destination_id);
                for tool in &update.tool_descriptors {
                    println!("      - {} {}", tool.tool_id, tool.tool_version);
                }
            }
        }
        match end_state {
            Some(state) => ui::success(&format!("disconnected ({state})")),
            None => ui::hint("relay did not confirm the goodbye in time"),
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_uplink::ToolDescriptor;

    #[test]
    fn test_collector_applies_retractions() {
        let collector = AnnouncementCollector::default();
        collector.on_tool_descriptor_list_update(ToolDescriptorListUpdate {
            destination_id: "alice###########default#exec".into(),
            display_name: "Alice".into(),
            tool_descriptors: vec![ToolDescriptor::new("grep", "1.0")],
        });
        assert_eq!(collector.snapshot().len(), 1);

        collector.on_tool_descriptor_list_update(ToolDescriptorListUpdate::retraction(
            "alice###########default#exec",
        ));
        assert!(collector.snapshot().is_empty());
    }
}
