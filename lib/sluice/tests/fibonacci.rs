//! Fibonacci from a feedback loop: a summer fed by two delay taps. Queues
//! are single-reader, so tee nodes duplicate the delayed streams. The
//! collector abandons its queue once the sequence passes the limit and the
//! resulting closed/abort cascade unwinds the whole cycle.

use sluice::prelude::*;
use std::sync::mpsc;
use std::time::Duration;

const MAX_FIB: u32 = 100;

fn read_value(input: &mut ReaderPort) -> Result<Option<u32>, QueueError> {
    let value = match input.dequeue_window(4, 0) {
        Ok(window) => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&window[..4]);
            u32::from_le_bytes(bytes)
        }
        Err(QueueError::Closed) => return Ok(None),
        Err(err) => return Err(err),
    };

    input.dequeue(4)?;
    Ok(Some(value))
}

fn write_value(out: &mut WriterPort, value: u32) -> Result<bool, QueueError> {
    match out.enqueue_bytes(&value.to_le_bytes()) {
        Ok(()) => Ok(true),
        // Downstream abandoned its end; time to wind down.
        Err(QueueError::Closed) => Ok(false),
        Err(err) => Err(err),
    }
}

fn delay_body(init: u32) -> impl FnMut(&NodeHandle) -> NodeResult + Send {
    move |node| {
        let mut input = node.reader("in");
        let mut out = node.writer("out");

        if !write_value(&mut out, init)? {
            return Ok(());
        }

        while let Some(value) = read_value(&mut input)? {
            if !write_value(&mut out, value)? {
                break;
            }
        }
        Ok(())
    }
}

fn tee_body() -> impl FnMut(&NodeHandle) -> NodeResult + Send {
    |node| {
        let mut input = node.reader("in");
        let mut out_a = node.writer("a");
        let mut out_b = node.writer("b");

        while let Some(value) = read_value(&mut input)? {
            if !write_value(&mut out_a, value)? || !write_value(&mut out_b, value)? {
                break;
            }
        }
        Ok(())
    }
}

fn queue(name: &str, writer: (&str, &str), reader: (&str, &str)) -> QueueAttr {
    QueueAttr::new(
        name,
        PortRef::new(writer.0, writer.1),
        PortRef::new(reader.0, reader.1),
        64,
    )
}

#[test]
fn fibonacci_feedback_loop() {
    let context = LocalContext::new(None);
    let kernel = Kernel::start(KernelConfig::new("fib"), context, None).unwrap();

    kernel
        .create_fn_node("summer", |node| {
            let mut in_a = node.reader("a");
            let mut in_b = node.reader("b");
            let mut out = node.writer("out");

            loop {
                let a = match read_value(&mut in_a)? {
                    Some(a) => a,
                    None => return Ok(()),
                };
                let b = match read_value(&mut in_b)? {
                    Some(b) => b,
                    None => return Ok(()),
                };
                if !write_value(&mut out, a + b)? {
                    return Ok(());
                }
            }
        })
        .unwrap();

    kernel.create_fn_node("delay1", delay_body(1)).unwrap();
    kernel.create_fn_node("delay2", delay_body(1)).unwrap();
    kernel.create_fn_node("tee1", tee_body()).unwrap();
    kernel.create_fn_node("tee2", tee_body()).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    kernel
        .create_fn_node("collector", move |node| {
            let mut input = node.reader("in");
            let mut sequence = Vec::new();

            while let Some(value) = read_value(&mut input)? {
                sequence.push(value);
                if value >= MAX_FIB {
                    break;
                }
            }

            // Abandon the stream; upstream sees closed writes and unwinds.
            input.shutdown()?;
            done_tx.send(sequence).unwrap();
            Ok(())
        })
        .unwrap();

    for attr in vec![
        queue("fib-sum-d1", ("summer", "out"), ("delay1", "in")),
        queue("fib-d1-tee1", ("delay1", "out"), ("tee1", "in")),
        queue("fib-tee1-a", ("tee1", "a"), ("summer", "a")),
        queue("fib-tee1-d2", ("tee1", "b"), ("delay2", "in")),
        queue("fib-d2-tee2", ("delay2", "out"), ("tee2", "in")),
        queue("fib-tee2-b", ("tee2", "a"), ("summer", "b")),
        queue("fib-tee2-col", ("tee2", "b"), ("collector", "in")),
    ] {
        kernel.create_queue(attr).unwrap();
    }

    let sequence = done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("collector did not finish");

    assert_eq!(&sequence[..10], &[1, 1, 2, 3, 5, 8, 13, 21, 34, 55]);
    assert!(*sequence.last().unwrap() >= MAX_FIB);

    kernel.wait_for_all_node_end().unwrap();
}
