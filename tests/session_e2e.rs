//! Host and client sessions talking over the real adapters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use voxlink_client::{ClientConfig, ClientSession, ConnectError, JoinApproval, WorldSyncEvent};
use voxlink_core::{ChunkCoord, ChunkDims, PeerId, ALL_PLAYERS};
use voxlink_net::{
    parse_join_info, MemoryRelay, PeerTransport, RelayTransport, TcpClientTransport,
    TcpHostTransport, WorldInfo,
};
use voxlink_server::{HostConfig, HostSession, RosterEvent};
use voxlink_testkit::flat_world;

const HOST_ID: &str = "host-puid";

fn world_info() -> WorldInfo {
    WorldInfo {
        world_name: "W".to_string(),
        seed: 42,
        chunk_dims: ChunkDims::new(16, 16, 16),
        ..WorldInfo::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        hello_interval_ms: 40,
        poll_interval_ms: 5,
        max_events_per_poll: 256,
    }
}

fn start_host(
    transport: Arc<dyn PeerTransport>,
    config: HostConfig,
) -> (Arc<HostSession>, JoinHandle<()>) {
    let world = Arc::new(flat_world(
        ChunkDims::new(16, 16, 16),
        &[ChunkCoord::new(0, 0, 0), ChunkCoord::new(1, 0, 0)],
    ));
    let host = Arc::new(HostSession::new(transport, world, world_info(), config));
    let pump = {
        let host = host.clone();
        tokio::spawn(async move {
            loop {
                host.poll();
                sleep(Duration::from_millis(2)).await;
            }
        })
    };
    (host, pump)
}

fn relay_client(relay: &MemoryRelay, id: &str) -> ClientSession {
    let transport = RelayTransport::client(relay.endpoint(id), HOST_ID.into());
    ClientSession::new(Arc::new(transport), client_config())
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

fn sync_events(session: &ClientSession) -> Vec<WorldSyncEvent> {
    std::iter::from_fn(|| session.queues().world_sync.pop()).collect()
}

fn assert_full_sync(events: &[WorldSyncEvent]) {
    assert_eq!(events.len(), 5, "{events:?}");
    assert_eq!(events[0], WorldSyncEvent::Welcome(1));
    assert_eq!(events[1], WorldSyncEvent::WorldInfo(world_info()));
    assert!(matches!(&events[2], WorldSyncEvent::Chunk(c)
        if c.coord == ChunkCoord::new(0, 0, 0) && c.blocks.len() == 4096));
    assert!(matches!(&events[3], WorldSyncEvent::Chunk(c) if c.coord == ChunkCoord::new(1, 0, 0)));
    assert_eq!(events[4], WorldSyncEvent::SyncComplete);
}

#[tokio::test]
async fn test_pre_approved_relay_client_receives_world() {
    let relay = MemoryRelay::new();
    let (host, pump) = start_host(
        Arc::new(RelayTransport::host(relay.endpoint(HOST_ID))),
        HostConfig::default(),
    );
    host.pre_approve_puid("client-puid");

    let host_peer = parse_join_info("voxlink://join/host-puid").expect("join info");
    let session = relay_client(&relay, "client-puid");
    let joined = session
        .connect(&host_peer, "Alice", Duration::from_secs(2))
        .await
        .expect("connect");
    assert_eq!(joined.player_id, 1);
    assert_eq!(joined.world_info, world_info());

    assert!(
        wait_for(|| {
            session.poll();
            session.is_world_synced() && session.players().len() == 2
        })
        .await
    );
    assert_full_sync(&sync_events(&session));
    let names: Vec<String> = session.players().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Host".to_string(), "Alice".to_string()]);
    assert!(host.pending_join_requests().is_empty());

    pump.abort();
    host.dispose();
}

#[tokio::test]
async fn test_manual_approval_then_chat_both_ways() {
    let relay = MemoryRelay::new();
    let (host, pump) = start_host(
        Arc::new(RelayTransport::host(relay.endpoint(HOST_ID))),
        HostConfig::default(),
    );
    let session = relay_client(&relay, "client-puid");
    let host_peer = PeerId::from(HOST_ID);

    let first = session
        .request_join_approval(&host_peer, "Alice", Duration::from_millis(100))
        .await
        .expect("request");
    assert_eq!(first, JoinApproval::Pending);
    let request = host.queues().join_requests.pop().expect("join request");
    assert_eq!(request.peer, PeerId::from("client-puid"));
    assert_eq!(request.name, "Alice");
    assert!(host.queues().join_requests.pop().is_none());

    assert!(host.approve_join_request(&request.peer));
    let second = session
        .request_join_approval(&host_peer, "Alice", Duration::from_secs(2))
        .await
        .expect("request");
    assert!(matches!(second, JoinApproval::Approved(ref joined) if joined.player_id == 1));
    assert_eq!(
        host.queues().roster.pop(),
        Some(RosterEvent::Joined {
            player_id: 1,
            name: "Alice".to_string()
        })
    );

    assert!(session.send_chat(ALL_PLAYERS, "hello host"));
    assert!(wait_for(|| !host.queues().chats.is_empty()).await);
    let chat = host.queues().chats.pop().expect("chat");
    assert_eq!(chat.from_player_id, 1);
    assert_eq!(chat.text, "hello host");

    assert_eq!(host.send_chat(1, "welcome"), 1);
    let mut received = Vec::new();
    assert!(
        wait_for(|| {
            session.poll();
            received.extend(std::iter::from_fn(|| session.queues().chats.pop()));
            received.iter().any(|chat| chat.from_player_id == 0)
        })
        .await
    );
    // Broadcast chat is echoed to its sender as well.
    let texts: Vec<(i32, &str)> = received
        .iter()
        .map(|chat| (chat.from_player_id, chat.text.as_str()))
        .collect();
    assert_eq!(texts, vec![(1, "hello host"), (0, "welcome")]);

    pump.abort();
    host.dispose();
}

#[tokio::test]
async fn test_declined_client_learns_reason() {
    let relay = MemoryRelay::new();
    let (host, pump) = start_host(
        Arc::new(RelayTransport::host(relay.endpoint(HOST_ID))),
        HostConfig::default(),
    );
    let session = relay_client(&relay, "client-puid");
    let host_peer = PeerId::from(HOST_ID);

    let first = session
        .request_join_approval(&host_peer, "Mallory", Duration::from_millis(100))
        .await
        .expect("request");
    assert_eq!(first, JoinApproval::Pending);
    assert!(host.decline_join_request(&PeerId::from("client-puid"), "Not today"));

    let outcome = session
        .request_join_approval(&host_peer, "Mallory", Duration::from_millis(500))
        .await;
    match outcome {
        Ok(JoinApproval::Declined(reason)) => assert_eq!(reason, "Not today"),
        Err(ConnectError::Disconnected(reason)) => assert_eq!(reason, "Not today"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(host.client_count(), 0);

    pump.abort();
    host.dispose();
}

#[tokio::test]
async fn test_tcp_join_then_host_shutdown() {
    let transport = TcpHostTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind");
    let addr = transport.local_addr();
    let config = HostConfig {
        require_approval: false,
        ..HostConfig::default()
    };
    let (host, pump) = start_host(Arc::new(transport), config);

    let client_transport = TcpClientTransport::connect(addr).await.expect("connect");
    let host_peer = client_transport.host_peer().clone();
    let session = ClientSession::new(Arc::new(client_transport), client_config());
    let joined = session
        .connect(&host_peer, "Bob", Duration::from_secs(5))
        .await
        .expect("join");
    assert_eq!(joined.player_id, 1);

    assert!(
        wait_for(|| {
            session.poll();
            session.is_world_synced()
        })
        .await
    );
    assert_full_sync(&sync_events(&session));

    assert!(session.send_block_set(3, 4, 5, 7));
    assert!(wait_for(|| !host.queues().block_sets.is_empty()).await);
    let set = host.queues().block_sets.pop().expect("block set");
    assert_eq!((set.player_id, set.x, set.y, set.z, set.block_id), (1, 3, 4, 5, 7));

    pump.abort();
    host.dispose();
    assert!(
        wait_for(|| {
            session.poll();
            !session.is_connected()
        })
        .await
    );
    assert_eq!(
        session.take_disconnect_reason().as_deref(),
        Some("The host closed the game")
    );
    assert!(session.take_disconnect_reason().is_none());
}

#[tokio::test]
async fn test_tcp_client_leaving_leaves_others_playing() {
    let transport = TcpHostTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind");
    let addr = transport.local_addr();
    let config = HostConfig {
        require_approval: false,
        ..HostConfig::default()
    };
    let (host, pump) = start_host(Arc::new(transport), config);

    let mut sessions = Vec::new();
    for name in ["Ann", "Ben"] {
        let client_transport = TcpClientTransport::connect(addr).await.expect("connect");
        let host_peer = client_transport.host_peer().clone();
        let session = ClientSession::new(Arc::new(client_transport), client_config());
        session
            .connect(&host_peer, name, Duration::from_secs(5))
            .await
            .expect("join");
        sessions.push(session);
    }
    let (ann, ben) = (&sessions[0], &sessions[1]);
    assert!(
        wait_for(|| {
            ann.poll();
            ann.players().len() == 3
        })
        .await
    );

    ben.dispose();
    assert!(
        wait_for(|| {
            ann.poll();
            ann.players().len() == 2
        })
        .await
    );
    let names: Vec<String> = ann.players().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Host".to_string(), "Ann".to_string()]);
    assert!(ann.is_connected());
    assert_eq!(host.client_count(), 1);
    let roster: Vec<RosterEvent> = std::iter::from_fn(|| host.queues().roster.pop()).collect();
    assert!(roster
        .iter()
        .any(|event| matches!(event, RosterEvent::Left { player_id: 2, .. })));

    assert!(ann.send_chat(ALL_PLAYERS, "still here"));
    assert!(wait_for(|| !host.queues().chats.is_empty()).await);
    assert_eq!(host.queues().chats.pop().expect("chat").text, "still here");

    pump.abort();
    host.dispose();
}
