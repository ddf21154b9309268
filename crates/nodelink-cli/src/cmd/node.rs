//! `nodelink node`: run a node until Ctrl+C.

use crate::ui;
use anyhow::Context;
use nodelink_types::config::load_config;
use nodelink_wire::rpc::{benchmark_service, BENCHMARK_SERVICE};
use nodelink_wire::NodeRuntime;
use std::path::PathBuf;

pub fn cmd_node(config: Option<PathBuf>, benchmark: bool, listen: Vec<String>) -> anyhow::Result<()> {
    let mut config = load_config(config.as_deref());
    config.node.listen.extend(listen);

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async move {
        let node = NodeRuntime::new(config).context("Invalid node configuration")?;
        if benchmark {
            node.register_service(benchmark_service());
        }
        let bound = node.start().await.context("Failed to start the node")?;

        ui::section("nodelink node");
        ui::kv_ok("Node id", &node.local_node_id().to_string());
        ui::kv("Name", &node.local_node().display_name);
        ui::kv("Relay", if node.local_node().is_relay { "yes" } else { "no" });
        for cp in &bound {
            ui::kv("Listening", &cp.to_string());
        }
        if benchmark {
            ui::kv("Service", BENCHMARK_SERVICE);
        }
        ui::blank();
        ui::hint("press Ctrl+C to stop");

        super::shutdown_signal().await;
        node.shutdown();
        ui::success("node stopped");
        Ok(())
    })
}
