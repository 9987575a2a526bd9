use clap::{App, Arg};
use serde_derive::{Deserialize, Serialize};
use sluice::context::server;
use std::path::Path;
use std::thread;
use std::time::Duration;
use weir::logging;

const DEFAULT_PORT: u16 = 28044;

#[derive(Serialize, Deserialize)]
struct DirectorConfig {
    address: String,
}

impl Default for DirectorConfig {
    fn default() -> DirectorConfig {
        DirectorConfig {
            address: format!("0.0.0.0:{}", DEFAULT_PORT),
        }
    }
}

impl DirectorConfig {
    fn load<P: AsRef<Path>>(path: P) -> DirectorConfig {
        serdeconv::from_toml_file(path).expect("Error loading director configuration file")
    }
}

pub fn main() {
    let matches = App::new("Director Service")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the process-network directory server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ADDRESS")
                .help("Listen address, overriding the config file")
                .long("address")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG_FILE") {
        Some(path) => DirectorConfig::load(path),
        None => DirectorConfig::default(),
    };

    if let Some(address) = matches.value_of("ADDRESS") {
        config.address = address.to_string();
    }

    let logger = logging::init();
    logging::info!(logger, "starting director"; "address" => &config.address);

    let handle = server::serve(&config.address, &logger).expect("Error starting directory server");
    logging::info!(logger, "director serving"; "address" => %handle.local_addr());

    // The server runs on its own threads; park the main one.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
