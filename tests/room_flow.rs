use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use webrtc_rooms::config::AppConfig;
use webrtc_rooms::media::StaticDevices;
use webrtc_rooms::peer::LocalNetwork;
use webrtc_rooms::room::{
    create_room, resolve_room, share_link, PeerPhase, RoomContext, RoomSession, RoomView,
};
use webrtc_rooms::session::{load_username, validate_and_store, MemoryStorage};
use webrtc_rooms::store::MemoryStore;

fn context(store: &MemoryStore, network: &LocalNetwork) -> RoomContext {
    let mut config = AppConfig::default();
    config.app.origin = "https://rooms.test".to_string();
    config.store.retry_backoff_ms = 1;
    RoomContext {
        store: Arc::new(store.clone()),
        network: Arc::new(network.clone()),
        devices: Arc::new(StaticDevices::all()),
        config,
    }
}

async fn wait_for(view: &mut watch::Receiver<RoomView>, what: impl Fn(&RoomView) -> bool) -> RoomView {
    let found = tokio::time::timeout(Duration::from_secs(5), view.wait_for(|v| what(v)))
        .await
        .expect("view condition timed out")
        .expect("room loop ended");
    found.clone()
}

#[tokio::test]
async fn create_join_and_hang_up() {
    let store = MemoryStore::new();
    let network = LocalNetwork::new();
    let ctx = context(&store, &network);

    let alice_storage = MemoryStorage::new();
    validate_and_store(&alice_storage, "alice").unwrap();
    let bobby_storage = MemoryStorage::new();
    validate_and_store(&bobby_storage, "bobby").unwrap();

    // A creates the room and shares the link
    let room = create_room(ctx.store.as_ref(), &ctx.config.store.rooms_collection)
        .await
        .unwrap();
    let alice = RoomSession::enter(&ctx, &room, &load_username(&alice_storage), None)
        .await
        .unwrap();
    let link = alice.view().borrow().share_link.clone();
    assert_eq!(link, share_link("https://rooms.test", &room));

    // B joins through the link
    let joined = resolve_room(ctx.store.as_ref(), &ctx.config.store, &link)
        .await
        .unwrap();
    assert_eq!(joined, room);
    let bobby = RoomSession::enter(&ctx, &joined, &load_username(&bobby_storage), None)
        .await
        .unwrap();

    let alice_id = alice.view().borrow().local_peer_id.clone();
    let bobby_id = bobby.view().borrow().local_peer_id.clone();

    let mut bobby_view = bobby.view();
    let seen = wait_for(&mut bobby_view, |v| {
        v.peers
            .iter()
            .any(|p| p.peer_id == alice_id && p.phase == PeerPhase::Connected)
    })
    .await;
    assert_eq!(seen.peers.len(), 1);
    assert_eq!(seen.peers[0].username, "alice");
    assert!(seen.peers[0].stream.is_some());

    let mut alice_view = alice.view();
    wait_for(&mut alice_view, |v| {
        v.peers
            .iter()
            .any(|p| p.peer_id == bobby_id && p.phase == PeerPhase::Connected)
    })
    .await;
    assert_eq!(network.calls_placed(&alice_id, &bobby_id), 1);

    alice.hang_up().await.unwrap();

    let after = wait_for(&mut bobby_view, |v| v.peers.is_empty()).await;
    assert!(after.peers.iter().all(|p| p.stream.is_none()));
    assert_eq!(network.open_calls(&bobby_id, &alice_id), 0);
    assert_eq!(network.open_calls(&alice_id, &bobby_id), 0);
    assert_eq!(network.calls_placed(&alice_id, &bobby_id), 1);
}

#[tokio::test]
async fn paused_camera_hides_without_hanging_up() {
    let store = MemoryStore::new();
    let network = LocalNetwork::new();
    let ctx = context(&store, &network);
    let room = create_room(ctx.store.as_ref(), "calls").await.unwrap();

    let alice = RoomSession::enter(&ctx, &room, "alice", None).await.unwrap();
    let bobby = RoomSession::enter(&ctx, &room, "bobby", None).await.unwrap();
    let alice_id = alice.view().borrow().local_peer_id.clone();
    let bobby_id = bobby.view().borrow().local_peer_id.clone();

    let mut bobby_view = bobby.view();
    wait_for(&mut bobby_view, |v| {
        v.peers.iter().any(|p| p.phase == PeerPhase::Connected)
    })
    .await;

    assert!(!alice.toggle_camera().await.unwrap());
    wait_for(&mut bobby_view, |v| {
        v.peers.iter().any(|p| p.phase == PeerPhase::Muted)
    })
    .await;

    assert!(alice.toggle_camera().await.unwrap());
    let shown = wait_for(&mut bobby_view, |v| {
        v.peers.iter().any(|p| p.phase == PeerPhase::Connected)
    })
    .await;
    assert!(shown.peers[0].stream.is_some());
    assert_eq!(network.calls_placed(&bobby_id, &alice_id), 1);
    assert_eq!(network.open_calls(&bobby_id, &alice_id), 1);
}

#[tokio::test]
async fn late_joiner_ignores_departed_peer() {
    let store = MemoryStore::new();
    let network = LocalNetwork::new();
    let ctx = context(&store, &network);
    let room = create_room(ctx.store.as_ref(), "calls").await.unwrap();

    let alice = RoomSession::enter(&ctx, &room, "alice", None).await.unwrap();
    alice.hang_up().await.unwrap();

    let bobby = RoomSession::enter(&ctx, &room, "bobby", None).await.unwrap();
    let bobby_id = bobby.view().borrow().local_peer_id.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(bobby.view().borrow().peers.is_empty());
    let alice_id = alice.view().borrow().local_peer_id.clone();
    assert_eq!(network.calls_placed(&bobby_id, &alice_id), 0);
}
