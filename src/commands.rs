//! Subcommand drivers.

use crate::config::SessionSettings;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};
use voxlink_client::{ClientSession, JoinApproval, JoinedWorld, WorldSyncEvent};
use voxlink_core::{PeerId, PlayerId, ALL_PLAYERS};
use voxlink_net::{
    parse_join_info, MemoryRelay, PlayerEntry, RelayTransport, TcpClientTransport,
    TcpHostTransport,
};
use voxlink_server::{HostSession, RosterEvent};
use voxlink_testkit::flat_world;

const HOST_HELP: &str = concat!(
    "commands: approve <peer> | decline <peer> [reason] | kick <id> [reason] | ",
    "say <text> | players | quit"
);
const LOOPBACK_HOST_ID: &str = "loopback-host";
const LOOPBACK_CLIENT_ID: &str = "loopback-client";

/// Host a flat world over TCP until `quit` or Ctrl-C.
pub async fn run_host(settings: SessionSettings) -> Result<()> {
    let transport = TcpHostTransport::bind(settings.bind)
        .await
        .context("Failed to start TCP host")?;
    let local_addr = transport.local_addr();
    let host = new_host(Arc::new(transport), &settings);
    info!(
        "Hosting '{}' on {} ({} chunks loaded)",
        settings.world.world_name,
        local_addr,
        settings.spawn_chunks().len()
    );
    println!("{HOST_HELP}");

    let mut ticker = interval(Duration::from_millis(settings.tick_ms.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                host.poll();
                report_host_events(&host);
            }
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !handle_host_command(&host, line.trim()) {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    host.dispose();
    info!("Host stopped");
    Ok(())
}

/// Join a TCP host, print the world sync, and send stdin lines as chat.
pub async fn run_join(
    settings: SessionSettings,
    addr: SocketAddr,
    name: &str,
    timeout_secs: u64,
) -> Result<()> {
    let transport = TcpClientTransport::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let host_peer = transport.host_peer().clone();
    let session = ClientSession::new(Arc::new(transport), settings.client.clone());

    let timeout = Duration::from_secs(timeout_secs.max(1));
    let joined = loop {
        match session
            .request_join_approval(&host_peer, name, timeout)
            .await
            .context("Join failed")?
        {
            JoinApproval::Approved(joined) => break joined,
            JoinApproval::Declined(reason) => bail!("Join declined: {reason}"),
            JoinApproval::Pending => println!("Waiting for the host to approve..."),
        }
    };
    print_joined(&joined);

    let mut ticker = interval(Duration::from_millis(settings.tick_ms.max(1)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.poll();
                report_client_events(&session);
                if !session.is_connected() {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) if !line.trim().is_empty() => {
                    session.send_chat(ALL_PLAYERS, line.trim());
                }
                Some(_) => {}
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                session.dispose();
                break;
            }
        }
    }

    if let Some(reason) = session.take_disconnect_reason() {
        println!("Disconnected: {reason}");
    }
    Ok(())
}

/// Host and client in one process over the in-process relay.
pub async fn run_loopback(settings: SessionSettings, name: &str) -> Result<()> {
    let relay = MemoryRelay::new();
    let host_transport = RelayTransport::host(relay.endpoint(LOOPBACK_HOST_ID));
    let join_info = format!("voxlink://join/{}", host_transport.local_id());
    let host = Arc::new(new_host(Arc::new(host_transport), &settings));
    host.pre_approve_puid(LOOPBACK_CLIENT_ID);

    let pump = {
        let host = host.clone();
        let tick = Duration::from_millis(settings.tick_ms.max(1));
        tokio::spawn(async move {
            loop {
                host.poll();
                report_host_events(&host);
                sleep(tick).await;
            }
        })
    };

    let host_peer = parse_join_info(&join_info)
        .with_context(|| format!("Malformed join info '{join_info}'"))?;
    info!("Joining {join_info}");
    let client_transport =
        RelayTransport::client(relay.endpoint(LOOPBACK_CLIENT_ID), host_peer.clone());
    let session = ClientSession::new(Arc::new(client_transport), settings.client.clone());
    let joined = session
        .connect(&host_peer, name, Duration::from_secs(5))
        .await
        .context("Loopback join failed")?;
    print_joined(&joined);

    session.send_chat(ALL_PLAYERS, "hello from the loopback client");
    for _ in 0..20 {
        session.poll();
        report_client_events(&session);
        if session.is_world_synced() && !session.players().is_empty() {
            break;
        }
        sleep(Duration::from_millis(settings.tick_ms.max(1))).await;
    }

    host.dispose();
    for _ in 0..5 {
        session.poll();
        report_client_events(&session);
        if !session.is_connected() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    pump.abort();
    if let Some(reason) = session.take_disconnect_reason() {
        println!("Disconnected: {reason}");
    }
    Ok(())
}

fn new_host(
    transport: Arc<dyn voxlink_net::PeerTransport>,
    settings: &SessionSettings,
) -> HostSession {
    let world = Arc::new(flat_world(
        settings.world.chunk_dims,
        &settings.spawn_chunks(),
    ));
    HostSession::new(
        transport,
        world,
        settings.world.clone(),
        settings.host.clone(),
    )
}

/// Returns `false` when the host should stop.
fn handle_host_command(host: &HostSession, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "" => {}
        "approve" => {
            if !host.approve_join_request(&PeerId::from(rest)) {
                println!("No pending request from '{rest}'");
            }
        }
        "decline" => {
            let (peer, reason) = rest.split_once(' ').unwrap_or((rest, "The host declined"));
            if !host.decline_join_request(&PeerId::from(peer), reason.trim()) {
                println!("No pending request from '{peer}'");
            }
        }
        "kick" => {
            let (id, reason) = rest.split_once(' ').unwrap_or((rest, "Kicked by the host"));
            match id.parse::<PlayerId>() {
                Ok(id) if host.kick_player(id, reason.trim()) => {}
                Ok(id) => println!("No player {id}"),
                Err(_) => println!("kick expects a player id"),
            }
        }
        "say" => {
            host.send_chat(ALL_PLAYERS, rest);
        }
        "players" => {
            for entry in host.players() {
                println!("  {:>3}  {}", entry.player_id, entry.name);
            }
            for request in host.pending_join_requests() {
                println!("  pending  {} ({})", request.peer, request.name);
            }
        }
        "quit" | "exit" => return false,
        _ => println!("{HOST_HELP}"),
    }
    true
}

fn report_host_events(host: &HostSession) {
    let queues = host.queues();
    while let Some(request) = queues.join_requests.pop() {
        println!(
            "Join request from {} ({}); type 'approve {}' or 'decline {}'",
            request.name, request.peer, request.peer, request.peer
        );
    }
    while let Some(event) = queues.roster.pop() {
        match event {
            RosterEvent::Joined { player_id, name } => {
                println!("{name} joined as player {player_id}")
            }
            RosterEvent::Left { player_id, reason } => {
                println!("Player {player_id} left: {reason}")
            }
        }
    }
    while let Some(chat) = queues.chats.pop() {
        let name = player_name(&host.players(), chat.from_player_id);
        println!("<{name}> {}", chat.text);
    }
    while let Some(set) = queues.block_sets.pop() {
        debug!(
            player_id = set.player_id,
            x = set.x,
            y = set.y,
            z = set.z,
            block_id = set.block_id,
            "Block changed"
        );
    }
    while let Some(record) = queues.persistence_snapshots.pop() {
        info!(player_id = record.player_id, bytes = record.payload.len(), "Received save data");
    }
    while queues.player_states.pop().is_some() {}
    while queues.item_spawns.pop().is_some() {}
    while queues.item_pickups.pop().is_some() {}
}

fn report_client_events(session: &ClientSession) {
    let queues = session.queues();
    let mut chunks = 0usize;
    while let Some(event) = queues.world_sync.pop() {
        match event {
            WorldSyncEvent::Chunk(_) => chunks += 1,
            WorldSyncEvent::SyncComplete => println!("World sync complete"),
            WorldSyncEvent::Welcome(_) | WorldSyncEvent::WorldInfo(_) => {}
        }
    }
    if chunks > 0 {
        println!("Received {chunks} chunks");
    }
    while let Some(list) = queues.player_lists.pop() {
        let names: Vec<&str> = list.players.iter().map(|p| p.name.as_str()).collect();
        println!("Players: {}", names.join(", "));
    }
    while let Some(chat) = queues.chats.pop() {
        let name = player_name(&session.players(), chat.from_player_id);
        println!("<{name}> {}", chat.text);
    }
    while let Some(teleport) = queues.teleports.pop() {
        println!("Teleported to ({:.1}, {:.1}, {:.1})", teleport.x, teleport.y, teleport.z);
    }
    while let Some(record) = queues.persistence_restores.pop() {
        info!(bytes = record.payload.len(), "Save data restored by host");
    }
    while queues.player_states.pop().is_some() {}
    while queues.block_sets.pop().is_some() {}
    while queues.item_spawns.pop().is_some() {}
    while queues.item_pickups.pop().is_some() {}
}

fn print_joined(joined: &JoinedWorld) {
    let info = &joined.world_info;
    println!(
        "Joined '{}' as player {} (seed {}, {:?}, chunks {}x{}x{})",
        info.world_name,
        joined.player_id,
        info.seed,
        info.game_mode,
        info.chunk_dims.x,
        info.chunk_dims.y,
        info.chunk_dims.z
    );
    if info.world_id.is_empty() {
        warn!("Host did not send a world id");
    }
}

fn player_name(players: &[PlayerEntry], player_id: PlayerId) -> String {
    players
        .iter()
        .find(|p| p.player_id == player_id)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| format!("player {player_id}"))
}
