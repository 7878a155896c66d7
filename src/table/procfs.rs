//! Linux port table read from `/proc/net/tcp` and `/proc/net/tcp6`

use super::{AddressFamily, PortEntry, PortTable, PortTableProvider, ProviderError, TcpState};
use std::io::ErrorKind;
use std::path::PathBuf;

const TCP_ESTABLISHED: u8 = 0x01;
const TCP_LISTEN: u8 = 0x0A;

/// Reads the kernel's TCP socket tables.
///
/// The root defaults to `/proc` and can be pointed elsewhere for tests.
#[derive(Debug, Clone)]
pub struct ProcNetProvider {
    proc_root: PathBuf,
}

impl Default for ProcNetProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcNetProvider {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn table_path(&self, family: AddressFamily) -> PathBuf {
        let file = match family {
            AddressFamily::Ipv4 => "tcp",
            AddressFamily::Ipv6 => "tcp6",
        };
        self.proc_root.join("net").join(file)
    }
}

impl PortTableProvider for ProcNetProvider {
    fn name(&self) -> &str {
        "procfs"
    }

    fn query(&self, family: AddressFamily, table: &mut PortTable) -> Result<(), ProviderError> {
        let content = match std::fs::read_to_string(self.table_path(family)) {
            Ok(content) => content,
            // IPv6 disabled in the kernel: no tcp6 file, no sockets
            Err(e) if e.kind() == ErrorKind::NotFound && family == AddressFamily::Ipv6 => {
                String::new()
            }
            Err(e) => return Err(e.into()),
        };
        table.fill(parse_proc_net_tcp(&content))
    }
}

/// Parse the content of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// Malformed rows are skipped.
pub(crate) fn parse_proc_net_tcp(content: &str) -> Vec<PortEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            // fields[1] is local_address:port, fields[3] is st, both hex
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let state = match u8::from_str_radix(fields[3], 16).ok()? {
                TCP_LISTEN => TcpState::Listen,
                TCP_ESTABLISHED => TcpState::Established,
                _ => TcpState::Other,
            };
            Some(PortEntry::new(port, state))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SAMPLE_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:15E0 00000000:0000 0A 00000000:00000000 00:00000000 00000000   108        0 12345 1 0000000000000000 100 0 0 10 0
   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 67890 1 0000000000000000 100 0 0 10 0
   2: 0100007F:15E3 AC10000A:D904 01 00000000:00000000 00:00000000 00000000  1000        0 11111 1 0000000000000000 100 0 0 10 0
   3: 0100007F:15E4 AC10000A:D905 06 00000000:00000000 00:00000000 00000000  1000        0 11112 1 0000000000000000 100 0 0 10 0
";

    const SAMPLE_TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:15E5 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 22222 1 0000000000000000 100 0 0 10 0
";

    fn write_proc(root: &Path, tcp: &str, tcp6: Option<&str>) {
        let net = root.join("net");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(net.join("tcp"), tcp).unwrap();
        if let Some(tcp6) = tcp6 {
            std::fs::write(net.join("tcp6"), tcp6).unwrap();
        }
    }

    #[test]
    fn test_parse_states_and_ports() {
        let entries = parse_proc_net_tcp(SAMPLE_TCP);
        assert_eq!(
            entries,
            vec![
                PortEntry::new(5600, TcpState::Listen),
                PortEntry::new(80, TcpState::Listen),
                PortEntry::new(5603, TcpState::Established),
                PortEntry::new(5604, TcpState::Other),
            ]
        );
    }

    #[test]
    fn test_parse_skips_garbage() {
        let content = "header\n  0: nonsense\n  1: 0100007F:ZZZZ 00000000:0000 0A\n";
        assert!(parse_proc_net_tcp(content).is_empty());
    }

    #[test]
    fn test_query_reads_both_families() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), SAMPLE_TCP, Some(SAMPLE_TCP6));
        let provider = ProcNetProvider::with_root(dir.path());

        let mut table = PortTable::with_capacity(16);
        provider.query(AddressFamily::Ipv4, &mut table).unwrap();
        assert_eq!(table.len(), 4);

        provider.query(AddressFamily::Ipv6, &mut table).unwrap();
        assert_eq!(table.entries(), &[PortEntry::new(5605, TcpState::Listen)]);
    }

    #[test]
    fn test_missing_tcp6_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), SAMPLE_TCP, None);
        let provider = ProcNetProvider::with_root(dir.path());

        let mut table = PortTable::with_capacity(16);
        provider.query(AddressFamily::Ipv6, &mut table).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_missing_tcp_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ProcNetProvider::with_root(dir.path());
        let mut table = PortTable::with_capacity(16);
        assert!(matches!(
            provider.query(AddressFamily::Ipv4, &mut table),
            Err(ProviderError::Io(_))
        ));
    }

    #[test]
    fn test_small_table_reports_required() {
        let dir = tempfile::tempdir().unwrap();
        write_proc(dir.path(), SAMPLE_TCP, None);
        let provider = ProcNetProvider::with_root(dir.path());

        let mut table = PortTable::with_capacity(2);
        match provider.query(AddressFamily::Ipv4, &mut table) {
            Err(ProviderError::InsufficientBuffer { required, .. }) => assert_eq!(required, 4),
            other => panic!("expected InsufficientBuffer, got {other:?}"),
        }
    }
}
