use std::net::{IpAddr, UdpSocket};

use tracing::debug;

/// Devine l'adresse IP locale de la machine.
///
/// Opens a UDP socket and "connects" it to a public address (8.8.8.8). No
/// packet is sent: the OS only picks the interface that would be used to
/// reach the target, and the socket's local address is that interface's IP.
///
/// Falls back to `127.0.0.1` when any step fails.
///
/// # Examples
///
/// ```
/// let ip = ccutils::guess_local_ip();
/// assert!(ip.parse::<std::net::IpAddr>().is_ok());
/// ```
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            debug!("No route to the reference address, falling back to loopback");
            "127.0.0.1".to_string()
        }
        Err(err) => {
            debug!(error = %err, "Cannot bind the UDP socket, falling back to loopback");
            "127.0.0.1".to_string()
        }
    }
}

/// Returns `true` when `host` designates every interface (`0.0.0.0`, `::`)
/// or is empty.
///
/// A server bound to such a host cannot advertise it in a URL: remote
/// devices need a concrete address, see [`guess_local_ip`].
pub fn is_unspecified_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_local_ip_returns_valid_ip() {
        let ip = guess_local_ip();

        assert!(ip.parse::<IpAddr>().is_ok(), "Should return a valid IP address");
    }

    #[test]
    fn test_guess_local_ip_is_ipv4() {
        let ip = guess_local_ip();

        if let Ok(parsed_ip) = ip.parse::<IpAddr>() {
            assert!(parsed_ip.is_ipv4(), "Should return an IPv4 address");
        }
    }

    #[test]
    fn test_unspecified_hosts() {
        assert!(is_unspecified_host("0.0.0.0"));
        assert!(is_unspecified_host("::"));
        assert!(is_unspecified_host("[::]"));
        assert!(is_unspecified_host(""));
    }

    #[test]
    fn test_concrete_hosts() {
        assert!(!is_unspecified_host("127.0.0.1"));
        assert!(!is_unspecified_host("192.168.1.20"));
        assert!(!is_unspecified_host("localhost"));
    }
}
