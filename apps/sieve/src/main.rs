mod nodes;

use clap::{App, Arg};
use serde_derive::{Deserialize, Serialize};
use sluice::context::LocalContext;
use sluice::loader;
use sluice::prelude::*;
use std::fs;
use std::path::Path;
use weir::logging;

#[derive(Serialize, Deserialize)]
struct SieveConfig {
    limit: u32,
    queue_capacity: usize,
}

impl Default for SieveConfig {
    fn default() -> SieveConfig {
        SieveConfig {
            limit: 100,
            queue_capacity: 256,
        }
    }
}

impl SieveConfig {
    fn load<P: AsRef<Path>>(path: P) -> SieveConfig {
        serdeconv::from_toml_file(path).expect("Error loading sieve configuration file")
    }
}

pub fn main() {
    let matches = App::new("Sieve of Eratosthenes")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Streams primes out of a self-extending filter chain.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("LIMIT")
                .help("Upper bound of the candidate range")
                .long("limit")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("GRAPH_FILE")
                .help("Build the graph from a JSON or XML document instead of code")
                .long("graph")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG_FILE") {
        Some(path) => SieveConfig::load(path),
        None => SieveConfig::default(),
    };

    if let Some(limit) = matches.value_of("LIMIT") {
        config.limit = limit.parse().expect("LIMIT must be an integer");
    }

    let logger = logging::init();
    logging::info!(logger, "starting sieve"; "limit" => config.limit);

    let context = LocalContext::new(&logger);
    let kernel =
        Kernel::start(KernelConfig::new("sieve"), context, &logger).expect("Error starting kernel");

    match matches.value_of("GRAPH_FILE") {
        Some(path) => {
            let text = fs::read_to_string(path).expect("Error reading graph file");
            let xml = path.ends_with(".xml");
            let document = loader::parse_document(&text, xml).expect("Error parsing graph file");
            loader::load_graph(&kernel, &document).expect("Error building graph");
        }
        None => build_graph(&kernel, &config),
    }

    kernel
        .wait_for_all_node_end()
        .expect("Error waiting for the graph to finish");
    logging::info!(logger, "sieve finished");
}

fn build_graph(kernel: &Kernel, config: &SieveConfig) {
    kernel
        .create_node(
            NodeAttr::new("producer", "sieve-producer", "sieve")
                .with_param(format!("{{\"limit\": {}}}", config.limit)),
        )
        .expect("Error creating producer");

    kernel
        .create_node(
            NodeAttr::new("filter-head", "sieve-filter", "sieve").with_param(format!(
                "{{\"prime\": 0, \"queue_capacity\": {}}}",
                config.queue_capacity
            )),
        )
        .expect("Error creating filter head");

    kernel
        .create_queue(QueueAttr::new(
            "sieve-feed",
            PortRef::new("producer", "out"),
            PortRef::new("filter-head", "in"),
            config.queue_capacity,
        ))
        .expect("Error creating feed queue");
}
