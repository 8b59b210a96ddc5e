//! Integration test: messages sent down outbound tunnels.
//!
//! The gateway pre-decrypts every hop's layer, each participant adds one
//! back, and the endpoint reassembles and delivers to the target router.

use hopnet_integration_tests::{router_hash, ExpectingReceiver, Network};
use hopnet_tunnel::config::{BatchConfig, TunnelConfig};
use hopnet_types::identity::TunnelId;
use hopnet_types::message::{MessageType, TunnelMessage};
use rand::Rng;

fn message(net: &Network, len: usize) -> TunnelMessage {
    let payload = (0..len).map(|i| (i % 251) as u8).collect();
    TunnelMessage::new(MessageType::Data, payload, net.now() + 60_000)
}

fn unbatched() -> TunnelConfig {
    TunnelConfig {
        pump_threads: 0,
        batch: BatchConfig {
            use_batching: false,
            ..BatchConfig::default()
        },
        ..TunnelConfig::default()
    }
}

#[test]
fn outbound_three_hops_delivers_to_router() {
    let net = Network::new(5).expect("network");
    let cfg = net.build_outbound(0, &[1, 2]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");

    let msg = message(&net, 200);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), tunnel, None, Some(router_hash(4)))
        .expect("dispatch");
    net.settle();

    let delivered = net.node(4).pool.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message, msg);
    assert_eq!(delivered[0].destination, None);

    // Each hop saw the cell exactly once.
    for i in 1..3 {
        let stats = net.node(i).ctx.stats().snapshot();
        assert_eq!(stats.cells_received, 1);
        assert_eq!(stats.corrupt_cells, 0);
    }
    assert_eq!(net.node(0).ctx.stats().snapshot().cells_sent, 1);
}

#[test]
fn outbound_large_message_spans_cells() {
    let net = Network::new(4).expect("network");
    let cfg = net.build_outbound(0, &[1, 2]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");

    let msg = message(&net, 20_000);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), tunnel, None, Some(router_hash(3)))
        .expect("dispatch");
    net.settle();

    let delivered = net.node(3).pool.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message, msg);
    let sent = net.node(0).ctx.stats().snapshot().cells_sent;
    assert!(sent >= 20, "20 KB needs at least 20 cells, sent {sent}");
    assert_eq!(net.node(2).ctx.stats().snapshot().messages_reassembled, 1);
}

#[test]
fn outbound_random_batch_round_trips() {
    let net = Network::new(4).expect("network");
    let cfg = net.build_outbound(0, &[1, 2]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");

    let mut rng = rand::thread_rng();
    let sent: Vec<TunnelMessage> = (0..25)
        .map(|_| message(&net, rng.gen_range(0..3_000)))
        .collect();
    for msg in &sent {
        net.node(0)
            .dispatcher
            .dispatch_outbound(msg.clone(), tunnel, None, Some(router_hash(3)))
            .expect("dispatch");
    }
    net.settle();

    let mut receiver = ExpectingReceiver::new(sent);
    receiver.collect(&net.node(3).pool);
    assert!(receiver.received_ok(), "received {} messages", receiver.received().len());
}

#[test]
fn outbound_batching_packs_small_messages() {
    let net = Network::new(3).expect("network");
    let cfg = net.build_outbound(0, &[1]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");

    for _ in 0..4 {
        net.node(0)
            .dispatcher
            .dispatch_outbound(message(&net, 50), tunnel, None, Some(router_hash(2)))
            .expect("dispatch");
    }
    // Below every flush threshold: nothing leaves until the delay passes.
    assert_eq!(net.wire().in_flight(), 0);
    net.settle();

    assert_eq!(net.node(2).pool.take().len(), 4);
    assert_eq!(net.node(0).ctx.stats().snapshot().cells_sent, 1);
}

#[test]
fn outbound_replayed_cell_dropped() {
    let net = Network::with_config(3, unbatched()).expect("network");
    let cfg = net.build_outbound(0, &[1]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");

    let msg = message(&net, 10);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), tunnel, None, Some(router_hash(2)))
        .expect("dispatch");

    let packet = net.next_packet().expect("cell to endpoint");
    assert_eq!(packet.to, router_hash(1));
    net.deliver(packet.clone());
    net.deliver(packet);
    net.run();

    assert_eq!(net.node(2).pool.take().len(), 1);
    assert_eq!(net.node(1).ctx.stats().snapshot().replayed_cells, 1);
}

#[test]
fn outbound_unknown_tunnel_rejected() {
    let net = Network::new(2).expect("network");
    let cfg = net.build_outbound(0, &[1]).expect("tunnel");
    let tunnel = cfg.config(0).and_then(|h| h.send_tunnel()).expect("gateway id");
    let other = loop {
        let id = TunnelId::random();
        if id != tunnel {
            break id;
        }
    };
    let result = net
        .node(0)
        .dispatcher
        .dispatch_outbound(message(&net, 1), other, None, Some(router_hash(1)));
    assert!(result.is_err());
    assert_eq!(net.node(0).ctx.stats().snapshot().unknown_tunnel, 1);
}
