//! Sieve of Eratosthenes over a dynamically growing filter chain. Every
//! filter forwards values its prime does not divide; the first value to
//! survive a filter is itself prime, gets reported, and spawns the next
//! filter in the chain at runtime.

use lazy_static::lazy_static;
use sluice::prelude::*;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref PRIMES: Mutex<Vec<u32>> = Mutex::new(Vec::new());
}

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

fn write_value(out: &mut WriterPort, value: u32) -> QueueResult<()> {
    out.enqueue_bytes(&value.to_le_bytes())
}

/// Filter with `prime == 0` is the chain head and passes everything.
struct FilterNode {
    prime: u32,
}

impl FilterNode {
    fn from_attr(attr: &NodeAttr) -> FilterNode {
        let param: serde_json::Value =
            serde_json::from_str(attr.param.as_str()).expect("filter param must be JSON");
        FilterNode {
            prime: param["prime"].as_u64().unwrap_or(0) as u32,
        }
    }
}

impl Node for FilterNode {
    fn run(&mut self, node: &NodeHandle) -> NodeResult {
        let mut input = node.reader("in");
        let mut downstream: Option<WriterPort> = None;

        while let Some(value) = read_value(&mut input)? {
            if value == 0 {
                // Producer end marker; the end-of-write cascade handles
                // shutdown, so it needs no forwarding.
                continue;
            }

            if self.prime != 0 && value % self.prime == 0 {
                continue;
            }

            match &mut downstream {
                Some(out) => write_value(out, value)?,
                None => {
                    // First survivor: a new prime. Splice a filter for it
                    // onto the end of the chain.
                    PRIMES.lock().unwrap().push(value);

                    let kernel = node.kernel();
                    let child = format!("filter-{}", value);

                    kernel
                        .create_node(
                            NodeAttr::new(&child, "sieve-filter", kernel.name())
                                .with_param(format!("{{\"prime\": {}}}", value)),
                        )
                        .map_err(|_| QueueError::KernelShutdown)?;
                    kernel
                        .create_queue(QueueAttr::new(
                            format!("sieve-q-{}", value),
                            PortRef::new(node.name(), "out"),
                            PortRef::new(&child, "in"),
                            256,
                        ))
                        .map_err(|_| QueueError::KernelShutdown)?;

                    downstream = Some(node.writer("out"));
                }
            }
        }

        if let Some(out) = &mut downstream {
            out.shutdown()?;
        }
        Ok(())
    }
}

#[test]
fn sieve_collects_primes_to_one_hundred() {
    PRIMES.lock().unwrap().clear();

    register_node_factory(
        "sieve-filter",
        std::sync::Arc::new(FnFactory::new(|attr| {
            Box::new(FilterNode::from_attr(attr)) as Box<dyn Node>
        })),
    );

    let context = LocalContext::new(None);
    let kernel = Kernel::start(KernelConfig::new("sieve"), context, None).unwrap();

    kernel
        .create_fn_node("producer", |node| {
            let mut out = node.writer("out");
            for value in 2u32..=100 {
                write_value(&mut out, value)?;
            }
            write_value(&mut out, 0)?;
            out.shutdown()?;
            Ok(())
        })
        .unwrap();

    // The chain head filters nothing and discovers the first prime.
    kernel
        .create_node(
            NodeAttr::new("filter-head", "sieve-filter", "sieve").with_param("{\"prime\": 0}"),
        )
        .unwrap();

    kernel
        .create_queue(QueueAttr::new(
            "sieve-feed",
            PortRef::new("producer", "out"),
            PortRef::new("filter-head", "in"),
            256,
        ))
        .unwrap();

    kernel.wait_node_start("producer").unwrap();
    kernel.wait_for_all_node_end().unwrap();

    let primes = PRIMES.lock().unwrap().clone();
    assert_eq!(
        primes,
        vec![
            2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79,
            83, 89, 97
        ]
    );

    // Bounded runtime sanity: the whole cascade must have wound down.
    std::thread::sleep(Duration::from_millis(10));
}
