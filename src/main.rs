mod backend;
mod cli;
mod cmd;
mod command;
mod config;
mod error;
mod fsutil;
mod guard;
mod images;
mod incus;
mod logger;
mod names;
mod platform;
mod prompt;
mod sandbox;
mod spinner;
mod state;
mod theme;

use tracing::{error, info};

fn main() {
    if let Err(e) = logger::init() {
        eprintln!("warning: logging disabled: {:#}", e);
    }
    info!(args = ?std::env::args().collect::<Vec<_>>(), "coop start");

    match cli::run() {
        Ok(code) => {
            info!(code, "coop finished");
            std::process::exit(code);
        }
        Err(err) => {
            error!(error = ?err, "coop failed");
            let cancel = err
                .downcast_ref::<error::Error>()
                .and_then(|e| e.user_cancel_message());
            match cancel {
                Some(msg) => eprintln!("{}", console::style(msg).dim()),
                None => eprintln!("Error: {:#}", err),
            }
            std::process::exit(1);
        }
    }
}
