//! Node implementations for the threshold sieve: a producer streaming the
//! candidate range and a self-extending chain of prime filters.

use sluice::prelude::*;
use sluice::register_node_type;
use weir::logging;

pub fn read_value(input: &mut ReaderPort) -> Result<Option<u32>, QueueError> {
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

pub fn write_value(out: &mut WriterPort, value: u32) -> QueueResult<()> {
    out.enqueue_bytes(&value.to_le_bytes())
}

/// Streams 2..=limit followed by a zero end marker.
pub struct ProducerNode {
    limit: u32,
}

impl ProducerNode {
    pub fn from_attr(attr: &NodeAttr) -> ProducerNode {
        let param: serde_json::Value = serde_json::from_str(&attr.param)
            .expect("producer param must be JSON");

        ProducerNode {
            limit: param["limit"].as_u64().unwrap_or(100) as u32,
        }
    }
}

impl Node for ProducerNode {
    fn run(&mut self, node: &NodeHandle) -> NodeResult {
        let mut out = node.writer("out");

        for value in 2..=self.limit {
            write_value(&mut out, value)?;
        }
        write_value(&mut out, 0)?;
        out.shutdown()?;

        logging::debug!(node.log(), "producer done"; "limit" => self.limit);
        Ok(())
    }
}

/// Drops multiples of its prime and splices a new filter onto the chain for
/// the first value that survives. A filter with prime zero passes
/// everything; it seeds the chain.
pub struct FilterNode {
    prime: u32,
    queue_capacity: usize,
}

impl FilterNode {
    pub fn from_attr(attr: &NodeAttr) -> FilterNode {
        let param: serde_json::Value = serde_json::from_str(&attr.param)
            .expect("filter param must be JSON");

        FilterNode {
            prime: param["prime"].as_u64().unwrap_or(0) as u32,
            queue_capacity: param["queue_capacity"].as_u64().unwrap_or(256) as usize,
        }
    }
}

impl Node for FilterNode {
    fn run(&mut self, node: &NodeHandle) -> NodeResult {
        let mut input = node.reader("in");
        let mut downstream: Option<WriterPort> = None;

        while let Some(value) = read_value(&mut input)? {
            if value == 0 {
                continue;
            }

            if self.prime != 0 && value % self.prime == 0 {
                continue;
            }

            match &mut downstream {
                Some(out) => write_value(out, value)?,
                None => {
                    println!("{}", value);
                    logging::debug!(node.log(), "prime discovered"; "prime" => value);

                    let kernel = node.kernel();
                    let child = format!("filter-{}", value);

                    kernel
                        .create_node(
                            NodeAttr::new(&child, "sieve-filter", kernel.name()).with_param(
                                format!(
                                    "{{\"prime\": {}, \"queue_capacity\": {}}}",
                                    value, self.queue_capacity
                                ),
                            ),
                        )
                        .map_err(|_| QueueError::KernelShutdown)?;
                    kernel
                        .create_queue(QueueAttr::new(
                            format!("sieve-{}", value),
                            PortRef::new(node.name(), "out"),
                            PortRef::new(&child, "in"),
                            self.queue_capacity,
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

register_node_type!(register_sieve_producer, "sieve-producer", |attr| {
    Box::new(ProducerNode::from_attr(attr)) as Box<dyn Node>
});

register_node_type!(register_sieve_filter, "sieve-filter", |attr| {
    Box::new(FilterNode::from_attr(attr)) as Box<dyn Node>
});
