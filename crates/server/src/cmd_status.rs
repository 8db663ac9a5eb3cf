//! `openchamber-server status`: query `/health` of a running instance.

use std::net::IpAddr;
use std::time::Duration;

use openchamber_protocol::HealthResponse;

use crate::VERSION;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(host: IpAddr, port: u16) -> anyhow::Result<()> {
    let url = format!("http://{}/health", std::net::SocketAddr::new(host, port));
    println!();
    println!("  OpenChamber Server v{VERSION}");

    let client = reqwest::Client::builder().timeout(STATUS_TIMEOUT).build()?;
    let health = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response.json::<HealthResponse>().await?,
        Ok(response) => {
            println!("  Health: {} ({url})", response.status());
            println!();
            return Ok(());
        }
        Err(_) => {
            println!("  Health: unreachable ({url})");
            println!();
            println!("  Server is not running.");
            println!("  Start with: openchamber-server serve");
            println!();
            return Ok(());
        }
    };

    println!("  Health: {} ({url})", health.status);
    match health.open_code_port {
        Some(port) => println!("  OpenCode port: {port}"),
        None => println!("  OpenCode port: not discovered"),
    }
    println!(
        "  OpenCode: {}",
        describe(health.open_code_running, health.is_open_code_ready)
    );
    if let Some(error) = &health.last_open_code_error {
        println!("  Last error: {error}");
    }
    println!();
    Ok(())
}

fn describe(running: bool, ready: bool) -> &'static str {
    match (running, ready) {
        (_, true) => "ready",
        (true, false) => "starting",
        (false, false) => "not running",
    }
}

#[cfg(test)]
mod tests {
    use super::describe;

    #[test]
    fn describes_agent_state() {
        assert_eq!(describe(true, true), "ready");
        assert_eq!(describe(true, false), "starting");
        assert_eq!(describe(false, false), "not running");
    }
}
