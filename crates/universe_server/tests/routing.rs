//! Packet ordering and world creation under concurrency.

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Barrier;
use std::thread;

use universe_server::net::Session;
use universe_server::universe::WorldStatus;
use universe_server::world::{InstanceWorldId, WarpAction, WarpToWorld, WorldId};
use universe_server::{ConnectionId, Packet};

const SEQUENCED: u16 = 100;

#[test]
fn test_world_packets_keep_per_sender_order() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;
    server.start().unwrap();

    let plaza = WorldId::Instance(InstanceWorldId::new("plaza"));
    let mut clients: Vec<(ConnectionId, Session)> = (0..3)
        .map(|n| {
            let (session, welcome) = connect_local(server, connect_info(&format!("pilot{n}")));
            (welcome.connection_id, session)
        })
        .collect();
    for (id, _) in &clients {
        assert!(wait_for(|| server.client_world(*id).is_some()));
        assert!(server.warp_client(*id, WarpAction::ToWorld(WarpToWorld::new(plaza.clone()))));
    }
    for (id, _) in &clients {
        assert!(wait_for(|| server.client_world(*id) == Some(plaza.clone())));
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut sent: HashMap<ConnectionId, u64> = HashMap::new();
    let mut inboxes: HashMap<ConnectionId, Vec<Packet>> = HashMap::new();
    for _ in 0..60 {
        let pick = rng.gen_range(0..clients.len());
        let batch = rng.gen_range(1..=4);
        let (id, session) = &mut clients[pick];
        let next = sent.entry(*id).or_default();
        let packets: Vec<Packet> = (0..batch)
            .map(|_| {
                let seq = *next;
                *next += 1;
                Packet::World {
                    kind: SEQUENCED,
                    payload: json!({ "from": id.0, "seq": seq }),
                }
            })
            .collect();
        session.send(packets);

        if rng.gen_bool(0.3) {
            let reader = rng.gen_range(0..clients.len());
            let (id, session) = &mut clients[reader];
            inboxes.entry(*id).or_default().extend(session.receive());
        }
    }

    let total: u64 = sent.values().sum();
    for (id, session) in &mut clients {
        let inbox = inboxes.entry(*id).or_default();
        assert!(wait_for(|| {
            inbox.extend(session.receive());
            inbox.iter().filter(|packet| matches!(packet, Packet::World { kind: SEQUENCED, .. })).count() as u64 >= total
        }));

        let mut seen: HashMap<u64, Vec<u64>> = HashMap::new();
        for packet in inbox.iter() {
            if let Packet::World { kind: SEQUENCED, payload } = packet {
                let from = payload["from"].as_u64().unwrap();
                seen.entry(from).or_default().push(payload["seq"].as_u64().unwrap());
            }
        }
        for (sender, count) in &sent {
            let expected: Vec<u64> = (0..*count).collect();
            assert_eq!(seen.get(&u64::from(sender.0)), Some(&expected), "receiver {id} from {sender}");
        }
    }

    server.stop();
}

#[test]
fn test_concurrent_create_or_get_yields_one_runner() {
    let universe = universe(test_config(), TestFactory::default());
    let server = &universe.server;
    let world = WorldId::Instance(InstanceWorldId::new("arena"));
    let threads = 12;
    let barrier = Barrier::new(threads);

    let runners = thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    assert!(wait_for(|| matches!(server.create_or_get(&world), WorldStatus::Live(_))));
                    match server.create_or_get(&world) {
                        WorldStatus::Live(runner) => runner,
                        _ => panic!("world fell out of the registry"),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
    });

    assert!(runners.iter().all(|runner| runner.same_runner(&runners[0])));
    assert_eq!(server.world_ids().iter().filter(|id| **id == world).count(), 1);
}
