//! Host-binding table: which backend fences which node.
//!
//! One line per node, whitespace separated:
//!
//! ```text
//! # node-address  backend-kind     backend-address
//! 10.0.0.101      direct-power     10.0.1.101
//! 10.0.0.102      redundant-proxy  v1,172.21.1.51:radia2
//! 10.0.0.200      virtualized-host vcenter.example.com:vm-42
//! ```
//!
//! The backend address is parsed once, here, into a typed
//! [`BackendBinding`]; nothing downstream re-parses strings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The three backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Single BMC, driven with ipmitool.
    DirectPower,
    /// Ordered list of powerman servers.
    RedundantProxy,
    /// vCenter-managed guest.
    VirtualizedHost,
}

impl BackendKind {
    /// Name used in the binding table and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirectPower => "direct-power",
            Self::RedundantProxy => "redundant-proxy",
            Self::VirtualizedHost => "virtualized-host",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct-power" => Ok(Self::DirectPower),
            "redundant-proxy" => Ok(Self::RedundantProxy),
            "virtualized-host" => Ok(Self::VirtualizedHost),
            other => Err(other.to_string()),
        }
    }
}

/// Powerman servers that can all switch `node`, in failover order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundantProxyBinding {
    /// Servers, highest priority first. Never empty.
    pub servers: Vec<String>,
    /// Node name as known to every listed server.
    pub node: String,
}

/// Guest managed through a vCenter API endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualizedHostBinding {
    /// API host name or address.
    pub api_host: String,
    /// Opaque guest identifier (e.g. `vm-42`).
    pub guest_id: String,
}

/// Backend bound to one node, with its typed address data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendBinding {
    /// BMC address.
    DirectPower {
        /// BMC host name or address.
        bmc: String,
    },
    /// Powerman server list and node name.
    RedundantProxy(RedundantProxyBinding),
    /// vCenter host and guest.
    VirtualizedHost(VirtualizedHostBinding),
}

impl BackendBinding {
    /// Kind of this binding.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::DirectPower { .. } => BackendKind::DirectPower,
            Self::RedundantProxy(_) => BackendKind::RedundantProxy,
            Self::VirtualizedHost(_) => BackendKind::VirtualizedHost,
        }
    }

    /// Parses the backend-specific address for `kind`.
    ///
    /// # Errors
    ///
    /// Returns a description of what is wrong with `address`.
    pub fn parse(kind: BackendKind, address: &str) -> Result<Self, String> {
        match kind {
            BackendKind::DirectPower => {
                if address.contains(':') || address.contains(',') {
                    return Err(format!("direct-power address {address:?} must be a single host"));
                }
                Ok(Self::DirectPower {
                    bmc: address.to_string(),
                })
            },
            BackendKind::RedundantProxy => {
                let (servers, node) = split_target(address, "server-list:node")?;
                let servers: Vec<String> = servers.split(',').map(str::to_string).collect();
                if servers.iter().any(String::is_empty) {
                    return Err(format!("empty server in list {address:?}"));
                }
                Ok(Self::RedundantProxy(RedundantProxyBinding {
                    servers,
                    node: node.to_string(),
                }))
            },
            BackendKind::VirtualizedHost => {
                let (api_host, guest_id) = split_target(address, "api-host:guest-id")?;
                Ok(Self::VirtualizedHost(VirtualizedHostBinding {
                    api_host: api_host.to_string(),
                    guest_id: guest_id.to_string(),
                }))
            },
        }
    }
}

/// Splits `left:right` on the last colon; both halves must be non-empty.
fn split_target<'a>(address: &'a str, shape: &str) -> Result<(&'a str, &'a str), String> {
    match address.rsplit_once(':') {
        Some((left, right)) if !left.is_empty() && !right.is_empty() => Ok((left, right)),
        _ => Err(format!("expected {shape}, got {address:?}")),
    }
}

/// One row of the binding table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    /// Node address as supplied by the quorum subsystem.
    pub address: String,
    /// Backend that fences it.
    pub backend: BackendBinding,
}

/// The loaded binding table, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingTable {
    entries: Vec<HostBinding>,
}

impl BindingTable {
    /// Reads and parses a binding table file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or any line is invalid.
    pub fn from_file(path: &Path) -> Result<Self, BindingError> {
        let content = std::fs::read_to_string(path).map_err(|source| BindingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Finds the binding for `address`.
    #[must_use]
    pub fn resolve(&self, address: &str) -> Option<&BackendBinding> {
        self.entries
            .iter()
            .find(|entry| entry.address == address)
            .map(|entry| &entry.backend)
    }

    /// All bindings in file order.
    #[must_use]
    pub fn entries(&self) -> &[HostBinding] {
        &self.entries
    }

    /// Number of bound nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no node is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<HostBinding> for BindingTable {
    fn from_iter<I: IntoIterator<Item = HostBinding>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl FromStr for BindingTable {
    type Err = BindingError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let mut entries: Vec<HostBinding> = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = text.split_whitespace().collect();
            let [address, kind, backend_address] = fields[..] else {
                return Err(BindingError::Malformed {
                    line,
                    reason: format!("expected 3 fields, found {}", fields.len()),
                });
            };

            let kind: BackendKind = kind
                .parse()
                .map_err(|kind| BindingError::UnknownKind { line, kind })?;
            let backend = BackendBinding::parse(kind, backend_address)
                .map_err(|reason| BindingError::Malformed { line, reason })?;

            if entries.iter().any(|e| e.address == address) {
                return Err(BindingError::Duplicate {
                    line,
                    address: address.to_string(),
                });
            }

            entries.push(HostBinding {
                address: address.to_string(),
                backend,
            });
        }

        Ok(Self { entries })
    }
}

/// Errors loading the binding table.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The backend kind is not one of the known kinds.
    #[error("line {line}: unknown backend kind {kind:?}")]
    UnknownKind {
        /// 1-based line number.
        line: usize,
        /// Kind as written.
        kind: String,
    },

    /// Wrong field count or a malformed backend address.
    #[error("line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What is wrong.
        reason: String,
    },

    /// The node address is bound more than once.
    #[error("line {line}: {address} is already bound")]
    Duplicate {
        /// 1-based line number of the second binding.
        line: usize,
        /// Node address.
        address: String,
    },
}
