use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

/// Checks whether the guest accepts connections before an apply.
pub trait ReachabilityProbe: Send + Sync {
    fn is_reachable(&self, address: &str) -> bool;
}

/// TCP connect to a fixed port (SSH by default).
#[derive(Clone, Debug)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ReachabilityProbe for TcpProbe {
    fn is_reachable(&self, address: &str) -> bool {
        let addrs = match (address, self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(address, error = %e, "cannot resolve guest address");
                return false;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return true,
                Err(e) => debug!(%addr, error = %e, "probe failed"),
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn listening_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let probe = TcpProbe {
            port: listener.local_addr().unwrap().port(),
            timeout: Duration::from_secs(2),
        };
        assert!(probe.is_reachable("127.0.0.1"));
    }

    #[test]
    fn closed_port_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe {
            port,
            timeout: Duration::from_secs(2),
        };
        assert!(!probe.is_reachable("127.0.0.1"));
    }

    #[test]
    fn unresolvable_host_is_unreachable() {
        let probe = TcpProbe::default();
        assert!(!probe.is_reachable("not a host name"));
    }
}
