//! Port table obtained by running `netstat -an`
//!
//! Works wherever a `netstat` binary exists. The parser understands the
//! Windows, Linux (net-tools) and BSD/macOS output layouts.

use super::{AddressFamily, PortEntry, PortTable, PortTableProvider, ProviderError, TcpState};
use std::process::Command;

#[derive(Debug, Clone)]
pub struct NetstatProvider {
    program: String,
    args: Vec<String>,
}

impl Default for NetstatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NetstatProvider {
    pub fn new() -> Self {
        Self::with_command("netstat", vec!["-an".to_string()])
    }

    /// Use a different executable and arguments
    pub fn with_command(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl PortTableProvider for NetstatProvider {
    fn name(&self) -> &str {
        "netstat"
    }

    fn query(&self, family: AddressFamily, table: &mut PortTable) -> Result<(), ProviderError> {
        // One process per call: each family and each resize retry runs netstat again
        let output = Command::new(&self.program).args(&self.args).output()?;
        if !output.status.success() {
            return Err(ProviderError::Command(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        table.fill(parse_netstat(&stdout, family))
    }
}

/// Extract the TCP rows of `family` from `netstat -an` output
pub(crate) fn parse_netstat(output: &str, family: AddressFamily) -> Vec<PortEntry> {
    output
        .lines()
        .filter_map(|line| parse_line(line, family))
        .collect()
}

fn parse_line(line: &str, family: AddressFamily) -> Option<PortEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let proto = tokens.first()?.to_ascii_lowercase();
    if !proto.starts_with("tcp") {
        return None;
    }

    // Windows: "TCP local remote state [pid]"
    // Unix:    "tcp recv-q send-q local remote state"
    let local = if tokens.get(1)?.parse::<u64>().is_ok() {
        tokens.get(3)?
    } else {
        tokens.get(1)?
    };

    if !matches_family(&proto, local, family) {
        return None;
    }

    let port = local
        .rsplit(|c| c == ':' || c == '.')
        .next()?
        .parse::<u16>()
        .ok()?;

    let state = tokens
        .iter()
        .skip(2)
        .find_map(|t| match t.to_ascii_uppercase().as_str() {
            "LISTEN" | "LISTENING" => Some(TcpState::Listen),
            "ESTABLISHED" => Some(TcpState::Established),
            _ => None,
        })
        .unwrap_or(TcpState::Other);

    Some(PortEntry::new(port, state))
}

fn matches_family(proto: &str, local: &str, family: AddressFamily) -> bool {
    match proto {
        "tcp4" => family == AddressFamily::Ipv4,
        "tcp6" => family == AddressFamily::Ipv6,
        "tcp46" => true,
        _ => {
            let is_v6 = local.starts_with('[') || local.matches(':').count() > 1;
            is_v6 == (family == AddressFamily::Ipv6)
        }
    }
}
