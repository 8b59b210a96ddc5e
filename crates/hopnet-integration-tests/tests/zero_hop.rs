//! Integration test: zero-hop tunnels skip batching and crypto entirely.

use hopnet_integration_tests::{router_hash, Network};
use hopnet_tunnel::codec::Delivery;
use hopnet_types::message::{MessageType, TunnelGatewayMessage, TunnelMessage};

#[test]
fn zero_hop_outbound_sends_directly() {
    let net = Network::new(3).expect("network");
    let cfg = net.build_outbound(0, &[]).expect("tunnel");
    assert_eq!(cfg.length(), 1);
    let id = cfg.config(0).and_then(|h| h.send_tunnel()).expect("id");

    let msg = TunnelMessage::new(MessageType::DeliveryStatus, vec![1; 12], net.now() + 60_000);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), id, None, Some(router_hash(2)))
        .expect("dispatch");

    // No batching delay: the message is on the wire at once, unwrapped.
    let packet = net.next_packet().expect("packet");
    assert_eq!(packet.to, router_hash(2));
    assert_eq!(packet.message, msg);
    assert_eq!(net.node(0).ctx.stats().snapshot().cells_sent, 0);
    assert_eq!(cfg.config(0).expect("hop").processed_messages(), 1);
}

#[test]
fn zero_hop_inbound_delivers_locally() {
    let net = Network::new(1).expect("network");
    let cfg = net.build_inbound(0, &[]).expect("tunnel");
    let id = cfg.config(0).and_then(|h| h.receive_tunnel()).expect("id");
    assert_eq!(net.node(0).dispatcher.counts().inbound_gateways, 1);

    let msg = TunnelMessage::new(MessageType::Data, vec![9; 64], net.now() + 60_000);
    net.node(0)
        .dispatcher
        .dispatch_gateway(TunnelGatewayMessage::new(id, msg.clone()));

    let delivered = net.node(0).pool.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message, msg);
}

#[test]
fn outbound_endpoint_into_zero_hop_inbound() {
    let net = Network::new(3).expect("network");
    let outbound = net.build_outbound(0, &[1]).expect("outbound");
    let inbound = net.build_inbound(2, &[]).expect("inbound");
    let out_id = outbound.config(0).and_then(|h| h.send_tunnel()).expect("outbound id");
    let in_id = inbound.config(0).and_then(|h| h.receive_tunnel()).expect("inbound id");

    let msg = TunnelMessage::new(MessageType::Garlic, vec![3; 1_500], net.now() + 60_000);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), out_id, Some(in_id), Some(router_hash(2)))
        .expect("dispatch");
    net.settle();

    let delivered = net.node(2).pool.take();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message, msg);
}

#[test]
fn zero_hop_delivery_to_own_tunnel_stays_local() {
    // The outbound endpoint targets a tunnel on its own router, so the
    // message never touches the wire again.
    let net = Network::new(2).expect("network");
    let outbound = net.build_outbound(0, &[1]).expect("outbound");
    let inbound = net.build_inbound(1, &[]).expect("inbound");
    let out_id = outbound.config(0).and_then(|h| h.send_tunnel()).expect("outbound id");
    let in_id = inbound.config(0).and_then(|h| h.receive_tunnel()).expect("inbound id");
    let delivery = Delivery::Tunnel {
        router: router_hash(1),
        tunnel: in_id,
    };

    let msg = TunnelMessage::new(MessageType::Data, vec![4; 100], net.now() + 60_000);
    net.node(0)
        .dispatcher
        .dispatch_outbound(msg.clone(), out_id, delivery.tunnel(), delivery.router())
        .expect("dispatch");
    net.settle();

    assert_eq!(net.node(1).pool.take().len(), 1);
    assert!(net.wire().take_lost().is_empty());
}
