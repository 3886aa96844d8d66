// src/server/mod.rs

//! The TCP front door of the coordinator. One JSON request per line, one
//! JSON response per line; `subscribe` switches the connection into
//! streaming mode on one of the two notification channels.

use crate::config::Config;
use crate::core::clock::SystemClock;
use crate::core::coordinator::{Coordinator, NodeReport};
use crate::core::events::EventBus;
use crate::core::fsm::{FormationKind, NodeHealth, ReplicationState, SyncState};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

/// The logical notification channels a client can subscribe to.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    State,
    Log,
}

/// One request line, dispatched on its `op` field.
#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateFormation {
        formation: String,
        kind: FormationKind,
    },
    RegisterNode {
        formation: String,
        #[serde(default = "default_group")]
        group: i32,
        name: String,
        port: u16,
        kind: FormationKind,
        #[serde(default = "default_candidate_priority")]
        candidate_priority: i32,
        #[serde(default = "default_replication_quorum")]
        replication_quorum: bool,
    },
    NodeActive {
        node_id: i64,
        reported_state: ReplicationState,
        #[serde(default)]
        reported_lsn: u64,
        #[serde(default)]
        sync_state: SyncState,
        #[serde(default = "default_pg_is_running")]
        pg_is_running: bool,
    },
    RemoveNode {
        node_id: i64,
    },
    SetReplicationSettings {
        node_id: i64,
        candidate_priority: i32,
        replication_quorum: bool,
    },
    SetNodeHealth {
        node_id: i64,
        health: NodeHealth,
    },
    GetPrimary {
        formation: String,
        #[serde(default)]
        group: i32,
    },
    GetNodes {
        formation: String,
        #[serde(default)]
        group: i32,
    },
    Subscribe {
        channel: Channel,
    },
}

fn default_group() -> i32 {
    -1
}

fn default_candidate_priority() -> i32 {
    100
}

fn default_replication_quorum() -> bool {
    true
}

fn default_pg_is_running() -> bool {
    true
}

/// Builds the coordinator and runs the listener until the process exits.
pub async fn run(config: Config, run_id: String) -> Result<()> {
    let clock = Arc::new(SystemClock::new());
    let bus = Arc::new(EventBus::new());
    let coordinator = Arc::new(Coordinator::new(
        clock,
        bus,
        config.formation_defaults,
    ));

    run_listener(&config.host, config.port, coordinator, run_id).await
}

/// Binds the listening socket and runs the accept loop.
pub async fn run_listener(
    host: &str,
    port: u16,
    coordinator: Arc<Coordinator>,
    run_id: String,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Coordinator listening for commands on {}:{}", host, port);
    serve(listener, coordinator, run_id).await
}

/// The accept loop over an already-bound socket: one task per connection.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    run_id: String,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let coordinator = coordinator.clone();
                let run_id = run_id.clone();
                tokio::spawn(async move {
                    info!("Accepted connection from: {}", addr);
                    if let Err(e) = handle_connection(socket, coordinator, run_id).await {
                        warn!("Error handling connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handles a single connection: request/response lines until the peer
/// disconnects, or an event stream after a `subscribe`.
async fn handle_connection(
    socket: TcpStream,
    coordinator: Arc<Coordinator>,
    run_id: String,
) -> Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());

    while let Some(result) = framed.next().await {
        let line = result?;
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = json!({ "ok": false, "error": format!("invalid request: {e}") });
                framed.send(response.to_string()).await?;
                continue;
            }
        };

        if let Request::Subscribe { channel } = request {
            // The greeting names this coordinator instance, so subscribers
            // notice restarts.
            framed
                .send(json!({ "ok": true, "subscribed": true, "run_id": run_id }).to_string())
                .await?;
            return stream_events(framed, coordinator, channel).await;
        }

        let response = process_request(request, &coordinator);
        framed.send(response.to_string()).await?;
    }

    Ok(())
}

/// Forwards every event published on the chosen channel to the peer, one
/// JSON line per event, in publication order.
async fn stream_events(
    mut framed: Framed<TcpStream, LinesCodec>,
    coordinator: Arc<Coordinator>,
    channel: Channel,
) -> Result<()> {
    match channel {
        Channel::State => {
            let mut receiver = coordinator.event_bus().subscribe_state();
            while let Ok(event) = receiver.recv().await {
                framed.send(serde_json::to_string(&event)?).await?;
            }
        }
        Channel::Log => {
            let mut receiver = coordinator.event_bus().subscribe_log();
            while let Ok(message) = receiver.recv().await {
                framed.send(json!({ "message": message }).to_string()).await?;
            }
        }
    }
    Ok(())
}

/// Executes one request against the coordinator and renders the response.
fn process_request(request: Request, coordinator: &Coordinator) -> Value {
    let result = match request {
        Request::CreateFormation { formation, kind } => coordinator
            .create_formation(&formation, kind)
            .map(|()| json!({ "ok": true })),

        Request::RegisterNode {
            formation,
            group,
            name,
            port,
            kind,
            candidate_priority,
            replication_quorum,
        } => coordinator
            .register_node(
                &formation,
                group,
                &name,
                port,
                kind,
                candidate_priority,
                replication_quorum,
            )
            .map(|registered| {
                json!({
                    "ok": true,
                    "node_id": registered.node_id,
                    "group": registered.group_id,
                    "goal_state": registered.goal_state,
                })
            }),

        Request::NodeActive {
            node_id,
            reported_state,
            reported_lsn,
            sync_state,
            pg_is_running,
        } => coordinator
            .node_active(
                node_id,
                NodeReport {
                    reported_state,
                    reported_lsn,
                    sync_state,
                    pg_is_running,
                },
            )
            .map(|goal_state| json!({ "ok": true, "goal_state": goal_state })),

        Request::RemoveNode { node_id } => coordinator
            .remove_node(node_id)
            .map(|removed| json!({ "ok": true, "removed": removed })),

        Request::SetReplicationSettings {
            node_id,
            candidate_priority,
            replication_quorum,
        } => coordinator
            .set_replication_settings(node_id, candidate_priority, replication_quorum)
            .map(|()| json!({ "ok": true })),

        Request::SetNodeHealth { node_id, health } => coordinator
            .set_node_health(node_id, health)
            .map(|()| json!({ "ok": true })),

        Request::GetPrimary { formation, group } => coordinator
            .get_primary(&formation, group)
            .map(|primary| json!({ "ok": true, "primary": primary })),

        Request::GetNodes { formation, group } => {
            Ok(json!({ "ok": true, "nodes": coordinator.get_nodes(&formation, group) }))
        }

        Request::Subscribe { .. } => unreachable!("subscribe is handled by the connection loop"),
    };

    match result {
        Ok(response) => response,
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}
