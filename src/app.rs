use std::path::PathBuf;
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use log::{error, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::adapter::BleAdapter;
use crate::device::btle::BtleAdapter;
use crate::device::types::MonitorEvent;
use crate::error::AppRunError;
use crate::monitor::Monitor;

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(Some(config)) => config,
        Ok(None) => {
            // this is probably the first start of the app
            info!("Config file is empty, using defaults");
            let config = Config::default();
            if let Err(err) = config_io.save(&config).await {
                warn!("Failed to write default config: {}", err);
            }
            config
        },
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", err);
            }
            Config::default()
        },
    }
}

/// Prints every reading as it arrives; stands in for a user interface.
fn reporter_task(cancel: CancellationToken, mut events: UnboundedReceiver<MonitorEvent>) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    Some(MonitorEvent::Reading(reading)) => println!("{}", reading),
                    Some(MonitorEvent::StateChange(state)) => println!("keyboard {}", state),
                    None => break 'mainloop,
                },
            }
        }
    })
}

fn print_history<A: BleAdapter>(monitor: &Monitor<A>) {
    let name = monitor.device_name().unwrap_or("no keyboard");
    let peripheral = monitor.peripheral_label().unwrap_or("peripheral");
    println!(
        "{}: central {}%, {} {}%, {} readings",
        name,
        monitor.current_central_level(),
        peripheral,
        monitor.current_peripheral_level(),
        monitor.history().len(),
    );
    for reading in monitor.history() {
        println!("  {}", reading);
    }
}

pub async fn run_application(config_path: Option<PathBuf>) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(config_path)?;
    // obtain an exclusive file lock so that only one instance of the monitor runs
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;

    let config = load_config(&config_io).await;
    let (adapter, adapter_events) = BtleAdapter::new().await?;

    let app_cancel = CancellationToken::new();
    let mut monitor = Monitor::new(adapter, config.device_name.clone());
    let reporter_handle = reporter_task(app_cancel.clone(), monitor.subscribe());

    let ctrl_c_cancel = app_cancel.clone();
    spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, stopping"),
            Err(err) => warn!("Failed to listen for ctrl-c: {}", err),
        }
        ctrl_c_cancel.cancel();
    });

    let monitor = monitor.run(adapter_events, app_cancel.clone()).await;
    app_cancel.cancel();

    if let Err(err) = reporter_handle.await {
        warn!("Failed to join reporter task: {}", err);
    }

    if config.print_history_on_exit {
        print_history(&monitor);
    }

    Ok(())
}
