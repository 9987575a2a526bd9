//! The remote context against a live directory server: key allocation,
//! lookups from a second client, kernel message relay, and a full
//! cross-kernel pipeline where every directory operation goes over TCP.

use sluice::context::server;
use sluice::context::{Context, KernelMsg, RemoteContext};
use sluice::prelude::*;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn directory_round_trip_and_key_uniqueness() {
    let server = server::serve("127.0.0.1:0", None).unwrap();
    let address = server.local_addr().to_string();

    let ctx1 = RemoteContext::connect(&address, None).unwrap();
    let ctx2 = RemoteContext::connect(&address, None).unwrap();

    let host1 = ctx1.setup_host("alpha", "127.0.0.1:7001").unwrap();
    let host2 = ctx2.setup_host("beta", "127.0.0.1:7002").unwrap();
    assert_ne!(host1, host2);

    // Duplicate names are refused.
    assert!(ctx2.setup_host("alpha", "addr").is_err());

    // Lookups cross clients.
    let seen = ctx2.host_info("alpha").unwrap().unwrap();
    assert_eq!(seen.key, host1);
    assert_eq!(seen.address, "127.0.0.1:7001");
    assert!(ctx1.host_info("gamma").unwrap().is_none());

    // Node and endpoint keys are unique and stable.
    let attr = NodeAttr::new("n1", "t", "alpha");
    let node = ctx1.create_node_key(host1, &attr).unwrap();

    let writer = ctx1.writer_key(node, "out").unwrap();
    let reader = ctx1.reader_key(node, "out").unwrap();
    assert_ne!(writer, reader);
    assert_eq!(ctx2.writer_key(node, "out").unwrap(), writer);

    let mut keys = vec![host1.raw(), host2.raw(), node.raw(), writer.raw(), reader.raw()];
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 5);

    // Endpoint wiring round-trips.
    ctx1.connect_endpoints(writer, reader).unwrap();
    let record = ctx2.endpoint_info(writer).unwrap().unwrap();
    assert_eq!(record.peer, Some(reader));

    // Lifecycle counters and waits.
    assert_eq!(ctx2.live_node_count().unwrap(), 0);
    ctx1.signal_node_start(node).unwrap();
    assert_eq!(ctx2.live_node_count().unwrap(), 1);

    ctx2.wait_node_start("n1").unwrap();

    let ender = ctx1.clone();
    let join = std::thread::spawn(move || ender.wait_all_nodes_end());
    std::thread::sleep(Duration::from_millis(50));
    ctx1.signal_node_end(node).unwrap();
    join.join().unwrap().unwrap();
}

#[test]
fn kernel_messages_relay_between_clients() {
    let server = server::serve("127.0.0.1:0", None).unwrap();
    let address = server.local_addr().to_string();

    let ctx1 = RemoteContext::connect(&address, None).unwrap();
    let ctx2 = RemoteContext::connect(&address, None).unwrap();

    let _host1 = ctx1.setup_host("relay-a", "addr-a").unwrap();
    let host2 = ctx2.setup_host("relay-b", "addr-b").unwrap();

    let (inbox_tx, inbox_rx) = mpsc::channel();
    ctx2.register_kernel(host2, inbox_tx).unwrap();

    let attr = NodeAttr::new("relayed", "worker", "relay-b").with_param("{\"x\": 1}");
    ctx1.send_kernel_msg(host2, KernelMsg::CreateNode(attr)).unwrap();

    match inbox_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
        KernelMsg::CreateNode(attr) => {
            assert_eq!(attr.name, "relayed");
            assert_eq!(attr.param, "{\"x\": 1}");
        }
        other => panic!("Unexpected message {:?}", other),
    }

    // Relaying to an unregistered host fails synchronously.
    let bogus = ctx1.send_kernel_msg(
        sluice::identity::HostKey(9999),
        KernelMsg::CreateNode(NodeAttr::new("x", "t", "h")),
    );
    assert!(bogus.is_err());
}

#[test]
fn cross_kernel_pipeline_over_remote_context() {
    let server = server::serve("127.0.0.1:0", None).unwrap();
    let address = server.local_addr().to_string();

    let ctx1 = RemoteContext::connect(&address, None).unwrap();
    let ctx2 = RemoteContext::connect(&address, None).unwrap();

    let k1 = Kernel::start(KernelConfig::new("rk1"), ctx1, None).unwrap();
    let k2 = Kernel::start(KernelConfig::new("rk2"), ctx2, None).unwrap();

    k1.create_fn_node("producer", |node| {
        let mut out = node.writer("out");
        for value in 0u32..=255 {
            out.enqueue_bytes(&[value as u8])?;
        }
        out.shutdown()?;
        Ok(())
    })
    .unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    k2.create_fn_node("consumer", move |node| {
        let mut input = node.reader("in");
        let mut received = Vec::new();

        loop {
            let byte = match input.dequeue_window(1, 0) {
                Ok(window) => window[0],
                Err(QueueError::Closed) => break,
                Err(err) => return Err(err),
            };
            input.dequeue(1)?;
            received.push(byte);
        }

        done_tx.send(received).unwrap();
        Ok(())
    })
    .unwrap();

    k1.create_queue(
        QueueAttr::new(
            "remote-pipe",
            PortRef::new("producer", "out"),
            PortRef::new("consumer", "in"),
            16,
        )
        .with_max_threshold(4),
    )
    .unwrap();

    let received = done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("consumer did not finish");

    assert_eq!(received.len(), 256);
    for (index, byte) in received.iter().enumerate() {
        assert_eq!(*byte as usize, index);
    }

    k1.wait_for_all_node_end().unwrap();
}
