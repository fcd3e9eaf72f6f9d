use std::env;
use std::process;

use em370::{Configuration, Emulator};

fn main() {
    env_logger::init();
    let path = env::args().nth(1).unwrap_or_else(|| "em370.cfg".to_string());
    let config = match Configuration::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            process::exit(1);
        }
    };
    let mut em = match Emulator::new(config) {
        Ok(em) => em,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    em.run();
    em.shutdown();
}
