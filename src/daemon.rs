use anyhow::{Context, Result};
use log::{error, info};
use pylonbms_lib::stack::{PylontechStack, StackSnapshot};
use pylonbms_lib::transport::Transport;
use pylonbms_lib::Error;
use serde_json::json;
use std::time::Duration;

fn print_snapshot(snapshot: &StackSnapshot, json_output: bool) -> Result<()> {
    if json_output {
        let record = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "status": snapshot.to_record()?,
        });
        println!("{}", serde_json::to_string(&record)?);
    } else {
        println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
        crate::print_record(&pylonbms_lib::stack::to_record(&snapshot.calculated)?, false)?;
        println!("--------------------------");
    }
    Ok(())
}

/// Polls the stack status every `interval` until the stack's stop signal is raised.
pub fn run<T: Transport>(
    stack: &mut PylontechStack<T>,
    interval: Duration,
    json_output: bool,
) -> Result<()> {
    info!(
        "Starting daemon mode: modules={}, interval={interval:?}, json={json_output}",
        stack.module_count()
    );

    let stop = stack.stop_signal();

    while !stop.is_stopped() {
        match stack.update() {
            Ok(Some(snapshot)) => print_snapshot(&snapshot, json_output)?,
            Ok(None) => break,
            Err(e @ Error::CommunicationLost { .. }) => {
                // try again next round, the bus may come back
                error!("Status round failed: {e}");
            }
            Err(e) => return Err(e).with_context(|| "Status round failed"),
        }
        if !stop.sleep(interval) {
            break;
        }
    }
    info!("Daemon stopped");
    Ok(())
}
