use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Result, TewError};

/// Binds and releases IP aliases on a local network interface.
#[tonic::async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Returns `false` when the alias was already present and nothing was
    /// added.
    async fn add_address(&self, ip: &str, interface: &str) -> Result<bool>;

    async fn remove_address(&self, ip: &str, interface: &str) -> Result<()>;

    async fn has_address(&self, ip: &str, interface: &str) -> Result<bool>;
}

/// Uses iproute2 (`ip addr`) and announces new bindings with a
/// gratuitous ARP through `arping` when it is installed.
#[derive(Debug, Clone, Default)]
pub struct IpCommandInterface;

impl IpCommandInterface {
    pub fn new() -> Self {
        Self
    }

    async fn ip(args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TewError::Network(format!("ip {}: {}", args.join(" "), e)))?;

        if !output.status.success() {
            return Err(TewError::Network(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn announce(ip: &str, interface: &str) {
        let result = Command::new("arping")
            .args(["-U", "-c", "1", "-I", interface, ip])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {
                tracing::debug!(ip, interface, "Sent gratuitous ARP");
            }
            Ok(status) => {
                tracing::warn!(ip, interface, status = %status, "Gratuitous ARP failed");
            }
            Err(e) => {
                tracing::warn!(ip, interface, error = %e, "arping not available");
            }
        }
    }
}

fn alias(ip: &str) -> String {
    format!("{}/32", ip)
}

#[tonic::async_trait]
impl NetworkInterface for IpCommandInterface {
    async fn add_address(&self, ip: &str, interface: &str) -> Result<bool> {
        if self.has_address(ip, interface).await? {
            // Peers may still cache another node's MAC for it.
            Self::announce(ip, interface).await;
            return Ok(false);
        }

        let address = alias(ip);
        Self::ip(&["addr", "add", &address, "dev", interface]).await?;
        Self::announce(ip, interface).await;
        Ok(true)
    }

    async fn remove_address(&self, ip: &str, interface: &str) -> Result<()> {
        if !self.has_address(ip, interface).await? {
            return Ok(());
        }

        let address = alias(ip);
        Self::ip(&["addr", "del", &address, "dev", interface]).await?;
        Ok(())
    }

    async fn has_address(&self, ip: &str, interface: &str) -> Result<bool> {
        let listing = Self::ip(&["-o", "addr", "show", "dev", interface]).await?;
        Ok(listing_contains(&listing, ip))
    }
}

/// Looks for `inet <ip>/` in `ip -o addr show` output.
fn listing_contains(listing: &str, ip: &str) -> bool {
    let needle = format!("{}/", ip);
    listing.lines().any(|line| {
        line.split_whitespace()
            .skip_while(|word| *word != "inet" && *word != "inet6")
            .nth(1)
            .map(|address| address.starts_with(&needle))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
2: eth0    inet 192.168.100.10/24 brd 192.168.100.255 scope global eth0\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.100.50/32 scope global eth0\\       valid_lft forever preferred_lft forever
";

    #[test]
    fn finds_bound_alias() {
        assert!(listing_contains(LISTING, "192.168.100.50"));
        assert!(listing_contains(LISTING, "192.168.100.10"));
    }

    #[test]
    fn prefix_of_other_address_does_not_match() {
        assert!(!listing_contains(LISTING, "192.168.100.5"));
        assert!(!listing_contains(LISTING, "10.0.0.1"));
        assert!(!listing_contains("", "10.0.0.1"));
    }
}
