use std::io;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::RwLock;

/// An ipv4 CIDR rule of the blocklist.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IpRange {
    base: u32,
    mask: u32,
}

impl IpRange {
    fn contains(&self, ip: u32) -> bool {
        ip & self.mask == self.base & self.mask
    }
}

/// An ip blocklist which is checked before dialing remote peers.
/// Reloading swaps the rule set in place, readers observe either the old or the new rules.
#[derive(Debug, Default)]
pub struct Blocklist {
    rules: RwLock<Vec<IpRange>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule set with the rules read from the given source.
    /// Lines contain a single ipv4 address or a CIDR range, empty lines and `#` comments are skipped.
    ///
    /// # Returns
    ///
    /// It returns the number of loaded rules, or an error when a line could not be parsed.
    pub fn reload<R: BufRead>(&self, reader: R) -> io::Result<usize> {
        let mut rules = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            rules.push(Self::parse_rule(line)?);
        }

        let count = rules.len();
        *self.rules.write().expect("blocklist lock poisoned") = rules;
        Ok(count)
    }

    /// Check if the given ip address is blocked.
    /// Only ipv4 addresses are matched against the rule set.
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V4(ip) => u32::from(*ip),
            IpAddr::V6(_) => return false,
        };

        self.rules
            .read()
            .expect("blocklist lock poisoned")
            .iter()
            .any(|rule| rule.contains(ip))
    }

    /// Get the number of rules within the blocklist.
    pub fn len(&self) -> usize {
        self.rules.read().expect("blocklist lock poisoned").len()
    }

    fn parse_rule(line: &str) -> io::Result<IpRange> {
        let (addr, prefix) = match line.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u32 = prefix.parse().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid blocklist prefix \"{}\"", line),
                    )
                })?;
                if prefix > 32 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid blocklist prefix \"{}\"", line),
                    ));
                }
                (addr, prefix)
            }
            None => (line, 32),
        };

        let addr: Ipv4Addr = addr.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid blocklist address \"{}\"", line),
            )
        })?;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };

        Ok(IpRange {
            base: u32::from(addr),
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_blocklist_reload() {
        let blocklist = Blocklist::new();
        let rules = "# generated blocklist\n10.0.0.0/8\n\n192.168.1.5\n";

        let result = blocklist
            .reload(Cursor::new(rules))
            .expect("expected the blocklist to have been loaded");

        assert_eq!(2, result);
        assert_eq!(2, blocklist.len());
    }

    #[test]
    fn test_blocklist_reload_invalid_line() {
        let blocklist = Blocklist::new();

        let result = blocklist.reload(Cursor::new("not-an-address\n"));

        assert_eq!(true, result.is_err());
    }

    #[test]
    fn test_blocklist_is_blocked() {
        let blocklist = Blocklist::new();
        blocklist
            .reload(Cursor::new("10.0.0.0/8\n192.168.1.5\n"))
            .unwrap();

        assert_eq!(
            true,
            blocklist.is_blocked(&IpAddr::V4(Ipv4Addr::new(10, 20, 30, 40)))
        );
        assert_eq!(
            true,
            blocklist.is_blocked(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)))
        );
        assert_eq!(
            false,
            blocklist.is_blocked(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 6)))
        );
    }

    #[test]
    fn test_blocklist_reload_replaces_rules() {
        let blocklist = Blocklist::new();
        blocklist.reload(Cursor::new("10.0.0.0/8\n")).unwrap();

        blocklist.reload(Cursor::new("172.16.0.0/12\n")).unwrap();

        assert_eq!(
            false,
            blocklist.is_blocked(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(
            true,
            blocklist.is_blocked(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)))
        );
    }
}
