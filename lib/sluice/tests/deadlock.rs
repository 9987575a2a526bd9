//! Deadlock detection and relief on a three-node cycle of one-byte queues.
//! Every node writes a byte then reads a byte, forever; with the detector
//! off the ring wedges almost immediately, with it on one queue grows and
//! the ring spins freely.

use sluice::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn ring_node(counter: Arc<AtomicU64>) -> impl FnMut(&NodeHandle) -> NodeResult + Send {
    move |node| {
        let mut out = node.writer("out");
        let mut input = node.reader("in");

        loop {
            // Two bytes out, two bytes in. The second byte only fits after
            // the downstream neighbor drains, so once every queue holds its
            // first byte the ring is in circular wait.
            match out.enqueue_bytes(&[1u8, 2u8]) {
                Ok(()) => (),
                Err(QueueError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            }

            let mut bytes = [0u8; 2];
            match input.dequeue_bytes(&mut bytes) {
                Ok(()) => (),
                Err(QueueError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            }

            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn run_ring(use_d4r: bool, runtime: Duration) -> u64 {
    let context = LocalContext::new(None);
    let config = if use_d4r {
        KernelConfig::new("ring")
    } else {
        KernelConfig::new("ring").without_d4r()
    };
    let kernel = Kernel::start(config, context, None).unwrap();

    let counter = Arc::new(AtomicU64::new(0));

    for &name in ["a", "b", "c"].iter() {
        kernel.create_fn_node(name, ring_node(counter.clone())).unwrap();
    }

    for (queue, writer, reader) in [("ring-ab", "a", "b"), ("ring-bc", "b", "c"), ("ring-ca", "c", "a")]
        .iter()
    {
        kernel
            .create_queue(QueueAttr::new(
                *queue,
                PortRef::new(*writer, "out"),
                PortRef::new(*reader, "in"),
                1,
            ))
            .unwrap();
    }

    thread::sleep(runtime);
    let iterations = counter.load(Ordering::Relaxed);

    kernel.terminate();
    kernel.wait_for_all_node_end().unwrap();

    iterations
}

#[test]
fn relief_keeps_the_ring_spinning() {
    let iterations = run_ring(true, Duration::from_secs(1));

    // A relieved ring of condvar handoffs does thousands of iterations per
    // second; anything under a thousand means it stalled somewhere.
    assert!(
        iterations >= 1000,
        "ring managed only {} iterations with relief enabled",
        iterations
    );
}

#[test]
fn without_detector_the_ring_wedges() {
    let iterations = run_ring(false, Duration::from_millis(500));

    // Each queue holds a single byte, so the ring wedges within a few
    // handoffs of startup.
    assert!(
        iterations < 100,
        "ring without detector should deadlock, made {} iterations",
        iterations
    );
}
