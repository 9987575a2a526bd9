//! End-to-end pipelines: the same producer/consumer graph hosted in one
//! kernel and spanned across two, plus cooperative cancellation.

use sluice::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn byte_pipeline(two_kernels: bool) -> Vec<u8> {
    let context = LocalContext::new(None);

    let k1 = Kernel::start(KernelConfig::new("k1"), context.clone(), None).unwrap();
    let k2 = if two_kernels {
        Some(Kernel::start(KernelConfig::new("k2"), context.clone(), None).unwrap())
    } else {
        None
    };

    let consumer_kernel = k2.as_ref().unwrap_or(&k1);

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
    consumer_kernel
        .create_fn_node("consumer", move |node| {
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

    // Capacity 16 / threshold 4 forces many block/ack round trips.
    k1.create_queue(
        QueueAttr::new(
            "pipe",
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

    k1.wait_for_all_node_end().unwrap();
    received
}

#[test]
fn single_kernel_pipeline_delivers_in_order() {
    let received = byte_pipeline(false);

    assert_eq!(received.len(), 256);
    for (index, byte) in received.iter().enumerate() {
        assert_eq!(*byte as usize, index);
    }
}

#[test]
fn cross_kernel_pipeline_delivers_in_order() {
    let received = byte_pipeline(true);

    // Moving the consumer onto another kernel must not change the bytes.
    assert_eq!(received.len(), 256);
    for (index, byte) in received.iter().enumerate() {
        assert_eq!(*byte as usize, index);
    }
}

#[test]
fn terminate_unblocks_running_nodes() {
    let context = LocalContext::new(None);
    let kernel = Kernel::start(KernelConfig::new("kt"), context, None).unwrap();

    let produced = Arc::new(AtomicU64::new(0));
    let producer_count = produced.clone();

    kernel
        .create_fn_node("producer", move |node| {
            let mut out = node.writer("out");
            loop {
                out.enqueue_bytes(&[7u8; 16])?;
                producer_count.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();

    kernel
        .create_fn_node("consumer", |node| {
            let mut input = node.reader("in");
            let mut sink = [0u8; 16];
            loop {
                input.dequeue_bytes(&mut sink)?;
                // Slow consumer keeps the producer mostly blocked.
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    kernel
        .create_queue(QueueAttr::new(
            "pipe",
            PortRef::new("producer", "out"),
            PortRef::new("consumer", "in"),
            64,
        ))
        .unwrap();

    kernel.wait_node_start("producer").unwrap();
    kernel.wait_node_start("consumer").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(produced.load(Ordering::Relaxed) > 0);

    let start = Instant::now();
    kernel.terminate();
    kernel.wait_for_all_node_end().unwrap();

    // Both bodies must fall out of their loops promptly.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn lifecycle_waits_observe_node_end() {
    let context = LocalContext::new(None);
    let kernel = Kernel::start(KernelConfig::new("kw"), context, None).unwrap();

    kernel
        .create_fn_node("short-lived", |_node| {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();

    kernel.wait_node_start("short-lived").unwrap();
    kernel.wait_node_terminate("short-lived").unwrap();
    kernel.wait_for_all_node_end().unwrap();
}
