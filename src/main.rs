mod btle;
mod clock;
mod codec;
mod config;
mod connection;
mod console;
mod device_scanner;
mod error;
mod export;
mod gatt;
mod orchestrator;
mod recorder;
mod scale;
mod timer;
mod timeseries;
mod transport;

use config::Config;
use connection::ConnectionManager;
use console::Input;
use std::io::BufRead;

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    // Events flow from the connection thread to the printer thread
    let (sink, events) = crossbeam_channel::unbounded();
    let (manager, commands) = ConnectionManager::new(sink, config);

    let connection_thread = std::thread::spawn(move || {
        manager.run();
    });
    let printer_thread = std::thread::spawn(move || console::run_printer(events));

    println!("{}", console::HELP);
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };
        match console::parse_line(&line) {
            Ok(Some(Input::Command(command))) => {
                if !commands.send(command) {
                    log::error!("Connection thread is gone");
                    break;
                }
            }
            Ok(Some(Input::Help)) => println!("{}", console::HELP),
            Ok(Some(Input::Quit)) => break,
            Ok(None) => {}
            Err(message) => println!("{}", message),
        }
    }

    commands.shutdown();
    drop(commands);
    if connection_thread.join().is_err() {
        log::error!("Connection thread panicked");
    }
    // The sink closes with the connection thread, which ends the printer
    if printer_thread.join().is_err() {
        log::error!("Printer thread panicked");
    }
}
