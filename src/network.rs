use std::{
    io,
    net::{IpAddr, UdpSocket},
    process::Command,
};

use tracing::debug;

/// Where the device can be reached, as shown on the status screen.
pub(crate) trait NetworkIdentity: Send {
    fn ip_address(&self) -> Option<IpAddr>;
    fn ssid(&self) -> Option<String>;
}

/**
 * Finds the address of the interface used for outbound traffic. Connecting a
 * UDP socket sends nothing; it only makes the kernel pick a route.
 */
pub(crate) fn detect_local_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}

/// Live lookups against the host: routing table for the IP, `iwgetid` for the SSID.
pub(crate) struct SystemNetwork;

impl NetworkIdentity for SystemNetwork {
    fn ip_address(&self) -> Option<IpAddr> {
        match detect_local_ip() {
            Ok(ip) => Some(ip),
            Err(err) => {
                debug!("Could not detect local IP: {}", err);
                None
            }
        }
    }

    fn ssid(&self) -> Option<String> {
        let output = match Command::new("iwgetid").arg("-r").output() {
            Ok(output) => output,
            Err(err) => {
                debug!("Could not run iwgetid: {}", err);
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        parse_ssid(&output.stdout)
    }
}

pub(crate) fn parse_ssid(stdout: &[u8]) -> Option<String> {
    let ssid = String::from_utf8_lossy(stdout).trim().to_string();
    if ssid.is_empty() {
        None
    } else {
        Some(ssid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssid_is_trimmed() {
        assert_eq!(parse_ssid(b"HomeNet\n"), Some("HomeNet".to_string()));
        assert_eq!(parse_ssid(b"  \n"), None);
        assert_eq!(parse_ssid(b""), None);
    }
}
