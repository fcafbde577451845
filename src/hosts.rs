//! Hosts-format files (`/etc/hosts` style) as a source of Name Table
//! entries.  Only IPv4 entries are kept: the table holds A records.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::protocol::types::DomainName;

/// The IPv4 entries of one or more hosts files.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Hosts {
    pub v4: HashMap<DomainName, Ipv4Addr>,
}

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a string of hosts data.  If a name appears more than
    /// once, the last line wins.
    ///
    /// # Errors
    ///
    /// If any line cannot be parsed.
    pub fn deserialise(data: &str) -> Result<Self, Error> {
        let mut hosts = Self::new();
        for (index, line) in data.lines().enumerate() {
            match parse_line(line) {
                Ok(Some((IpAddr::V4(address), names))) => {
                    for name in names {
                        hosts.v4.insert(name, address);
                    }
                }
                Ok(_) => (),
                Err(kind) => {
                    return Err(Error {
                        line: index + 1,
                        kind,
                    })
                }
            }
        }
        Ok(hosts)
    }

    /// Merge another hosts file into this one.  If the same name is
    /// in both, the new file wins.
    pub fn merge(&mut self, other: Hosts) {
        self.v4.extend(other.v4);
    }
}

/// Parse a single line into an address and the names it is given.
/// Blank lines, comment lines, and lines with an address but no names
/// give `None`.
fn parse_line(line: &str) -> Result<Option<(IpAddr, Vec<DomainName>)>, ErrorKind> {
    if !line.is_ascii() {
        return Err(ErrorKind::ExpectedAscii);
    }

    let content = match line.split_once('#') {
        Some((before, _)) => before,
        None => line,
    };
    let mut fields = content.split_ascii_whitespace();

    let Some(address_str) = fields.next() else {
        return Ok(None);
    };

    // link-local addresses with an interface scope (`fe80::1%lo0`)
    // can't be served, skip the line
    if address_str.contains('%') {
        return Ok(None);
    }

    let address = IpAddr::from_str(address_str).map_err(|_| ErrorKind::CouldNotParseAddress {
        address: address_str.into(),
    })?;

    let mut names = Vec::new();
    for name_str in fields {
        match DomainName::from_relative_dotted_string(&DomainName::root_domain(), name_str) {
            Some(name) => names.push(name),
            None => {
                return Err(ErrorKind::CouldNotParseName {
                    name: name_str.into(),
                })
            }
        }
    }

    if names.is_empty() {
        Ok(None)
    } else {
        Ok(Some((address, names)))
    }
}

/// An error that can occur reading a hosts file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct Error {
    pub line: usize,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("expected ASCII")]
    ExpectedAscii,
    #[error("could not parse address '{address}'")]
    CouldNotParseAddress { address: String },
    #[error("could not parse name '{name}'")]
    CouldNotParseName { name: String },
}
