// Vigil command line
//
//   vigil monitor [--camera N]   run monitoring, print events as JSON lines
//   vigil alerts [YYYYMMDD]      alert log for a day (default today)
//   vigil summary [DAYS]         alert counts per day (default 7)
//   vigil recordings             list recordings, newest first
//   vigil config                 print the effective config and its warnings

use std::io::BufRead;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::RecvTimeoutError;

use vigil_lib::config::{default_config_path, Config};
use vigil_lib::session::{AlertLog, RecordingLibrary};

const USAGE: &str = "usage: vigil <monitor [--camera N] | alerts [YYYYMMDD] | summary [DAYS] | recordings | config>";

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> anyhow::Result<()> {
    let config_path = default_config_path();
    let mut config = Config::load_or_default(&config_path);

    match args.first().map(String::as_str) {
        Some("monitor") => {
            if let Some(camera) = flag_value(args, "--camera") {
                config.camera_index = camera.parse().context("--camera expects a device index")?;
            }
            monitor(config)
        }
        Some("alerts") => {
            let log = AlertLog::new(config.logs_dir());
            let entries = match args.get(1) {
                Some(date) => log.read_date_str(date)?,
                None => log.read_day(Utc::now().date_naive())?,
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        Some("summary") => {
            let days = match args.get(1) {
                Some(days) => days.parse().context("summary expects a number of days")?,
                None => 7,
            };
            let summary = AlertLog::new(config.logs_dir()).summary(Utc::now().date_naive(), days)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Some("recordings") => {
            let recordings = RecordingLibrary::new(config.recordings_dir()).list()?;
            println!("{}", serde_json::to_string_pretty(&recordings)?);
            Ok(())
        }
        Some("config") => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            match config.validate() {
                Ok(warnings) => {
                    for warning in warnings {
                        eprintln!("warning: {}", warning);
                    }
                }
                Err(e) => eprintln!("invalid: {}", e),
            }
            Ok(())
        }
        _ => anyhow::bail!(USAGE),
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Run until stdin closes or reads "stop", or monitoring ends on its own
fn monitor(config: Config) -> anyhow::Result<()> {
    let mut monitor = vigil_lib::build_monitor(config)?;
    let events = monitor.subscribe_events();
    monitor.start()?;

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    std::thread::Builder::new()
        .name("vigil-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if line.trim() == "stop" => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            let _ = quit_tx.send(());
        })?;

    loop {
        if quit_rx.try_recv().is_ok() || !monitor.is_running() {
            break;
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    monitor.stop();
    let status = monitor.status();
    if let Some(error) = &status.last_error {
        anyhow::bail!("Monitoring stopped: {}", error);
    }
    Ok(())
}
