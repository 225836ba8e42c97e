//! End-to-end client and world lifecycle scenarios driven by manual ticks.

mod common;

use common::*;
use crossbeam::channel;
use serde_json::json;

use universe_server::net::ChatMode;
use universe_server::storage::{Storage, StorageKey};
use universe_server::universe::{WorldState, WorldStatus};
use universe_server::world::{InstanceWorldId, WarpAction, WarpAlias, WarpToWorld, WorldId};
use universe_server::Packet;

fn instance(name: &str) -> WorldId {
    WorldId::Instance(InstanceWorldId::new(name))
}

fn warp_to(world: WorldId) -> WarpAction {
    WarpAction::ToWorld(WarpToWorld::new(world))
}

#[test]
fn test_local_client_boards_delayed_ship_on_fourth_tick() {
    let (gate_tx, gate_rx) = channel::bounded(1);
    let factory = TestFactory {
        ship_gate: Some(gate_rx),
        ..TestFactory::default()
    };
    let universe = universe(test_config(), factory);
    let server = &universe.server;

    let info = connect_info("Nova");
    let ship = WorldId::ClientShip(info.player_uuid);
    let (mut session, welcome) = connect_local(server, info);
    let id = welcome.connection_id;
    assert!(server.client_summaries()[0].admin, "local clients are admins");

    // Tick 1 is the pass that sees the connection and starts the ship.
    assert!(tick_until(server, || server.has_pending_warp(id)));
    assert!(matches!(server.world_state(&ship), Some(WorldState::Loading { ready: false })));

    server.tick();
    server.tick();
    assert!(server.has_pending_warp(id));
    assert_eq!(server.client_world(id), None);

    gate_tx.send(()).unwrap();
    assert!(wait_for(|| matches!(
        server.world_state(&ship),
        Some(WorldState::Loading { ready: true })
    )));

    server.tick();
    assert_eq!(server.client_world(id), Some(ship.clone()));
    assert!(!server.has_pending_warp(id));

    let mut inbox = Vec::new();
    assert!(receive_until(&mut session, &mut inbox, |packet| {
        matches!(packet, Packet::WorldStart { world } if *world == ship)
    }));
    assert!(inbox.iter().any(|packet| matches!(
        packet,
        Packet::PlayerWarpResult { success: true, .. }
    )));
}

#[test]
fn test_errored_world_evacuates_and_is_rebuilt() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;

    let info = connect_info("Vega");
    let ship = WorldId::ClientShip(info.player_uuid);
    let (mut session, welcome) = connect_local(server, info);
    let id = welcome.connection_id;
    assert!(tick_until(server, || server.client_world(id) == Some(ship.clone())));

    let unstable = instance(UNSTABLE);
    assert!(server.warp_client(id, warp_to(unstable.clone())));
    assert!(tick_until(server, || server.client_world(id) == Some(unstable.clone())));
    let WorldStatus::Live(old) = server.create_or_get(&unstable) else {
        panic!("unstable world should be live");
    };

    assert!(tick_until(server, || {
        server.client_world(id) == Some(ship.clone())
            && matches!(server.world_state(&unstable), Some(WorldState::Broken))
    }));
    assert!(old.has_errored());

    let mut inbox = Vec::new();
    assert!(receive_until(&mut session, &mut inbox, |packet| {
        matches!(packet, Packet::WorldStop { reason } if reason == "world errored")
    }));

    let mut fresh = None;
    assert!(tick_until(server, || match server.create_or_get(&unstable) {
        WorldStatus::Live(runner) => {
            fresh = Some(runner);
            true
        }
        _ => false,
    }));
    let fresh = fresh.unwrap();
    assert!(!fresh.same_runner(&old));
    assert!(!fresh.has_errored());
}

#[test]
fn test_disconnect_is_idempotent() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;

    let info = connect_info("Altair");
    let uuid = info.player_uuid;
    let (mut session, welcome) = connect_local(server, info);
    let id = welcome.connection_id;
    assert!(tick_until(server, || server.client_world(id).is_some()));

    assert!(server.kick(id, "bye"));
    assert!(!server.kick(id, "bye again"));
    assert_eq!(server.client_count(), 0);
    assert!(!server.warp_client(id, WarpAction::own_ship()));
    assert!(!server.has_pending_warp(id));

    let mut inbox = Vec::new();
    assert!(receive_until(&mut session, &mut inbox, |packet| {
        matches!(packet, Packet::ServerDisconnect { reason } if reason == "bye")
    }));
    let disconnects = inbox
        .iter()
        .filter(|packet| matches!(packet, Packet::ServerDisconnect { .. }))
        .count();
    assert_eq!(disconnects, 1);
    assert!(wait_for(|| universe.storage.contains(&StorageKey::Client(uuid))));

    // The freed id is handed out again.
    let (_session, again) = connect_local(server, connect_info("Deneb"));
    assert_eq!(again.connection_id, id);
}

#[test]
fn test_stale_return_warp_falls_back_to_own_ship_in_one_tick() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;

    let info = connect_info("Rigel");
    let ship = WorldId::ClientShip(info.player_uuid);
    let stale = instance("void-outpost");
    let record = json!({
        "uuid": info.player_uuid,
        "name": info.player_name,
        "species": info.species,
        "return_warp": WarpToWorld::new(stale.clone()),
    });
    universe
        .storage
        .save(&StorageKey::Client(info.player_uuid), &serde_json::to_vec(&record).unwrap())
        .unwrap();

    let (mut session, welcome) = connect_local(server, info);
    let id = welcome.connection_id;
    assert!(tick_until(server, || server.client_world(id) == Some(ship.clone())));

    server.create_or_get(&stale);
    assert!(tick_until(server, || matches!(server.world_state(&stale), Some(WorldState::Broken))));

    let mut inbox = Vec::new();
    assert!(receive_until(&mut session, &mut inbox, |packet| {
        matches!(packet, Packet::PlayerWarpResult { success: true, .. })
    }));
    inbox.clear();

    assert!(server.warp_client(id, WarpAction::Alias(WarpAlias::Return)));
    server.tick();
    assert!(!server.has_pending_warp(id));
    assert_eq!(server.client_world(id), Some(ship));

    assert!(receive_until(&mut session, &mut inbox, |packet| {
        matches!(packet, Packet::PlayerWarpResult { success: true, .. })
    }));
    let results: Vec<(bool, WarpAction)> = inbox
        .iter()
        .filter_map(|packet| match packet {
            Packet::PlayerWarpResult { success, action, .. } => Some((*success, action.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![
            (false, WarpAction::Alias(WarpAlias::Return)),
            (true, WarpAction::own_ship()),
        ]
    );
}

#[test]
fn test_chat_commands_and_whispers() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;

    let (mut first, one) = connect_local(server, connect_info("Sol"));
    let (mut second, two) = connect_local(server, connect_info("Luna"));
    assert!(tick_until(server, || {
        server.client_world(one.connection_id).is_some() && server.client_world(two.connection_id).is_some()
    }));

    first.send(vec![Packet::ChatSend {
        mode: ChatMode::Whisper,
        text: "luna psst".into(),
    }]);
    first.send(vec![Packet::ChatSend {
        mode: ChatMode::Broadcast,
        text: "/warpdrive".into(),
    }]);

    let mut inbox = Vec::new();
    assert!(wait_for(|| {
        server.tick();
        inbox.extend(second.receive());
        inbox.iter().any(|packet| matches!(packet, Packet::ChatReceive { text, .. } if text == "psst"))
    }));

    let mut own = Vec::new();
    assert!(wait_for(|| {
        server.tick();
        own.extend(first.receive());
        own.iter()
            .any(|packet| matches!(packet, Packet::ChatReceive { text, .. } if text.contains("/warpdrive")))
    }));
}
