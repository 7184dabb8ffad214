use log::{debug, trace};
use std::io::Write;

use crate::error::Result;

/// Guest writes here land on the host's standard output.
pub const STDOUT_PORT: u16 = 0;
/// Diagnostic channel, relayed to standard error by the binary.
pub const DIAG_PORT: u16 = 1;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Diag,
}

impl Channel {
    pub fn from_port(port: u16) -> Option<Self> {
        match port {
            STDOUT_PORT => Some(Channel::Stdout),
            DIAG_PORT => Some(Channel::Diag),
            _ => None,
        }
    }
}


/// The two-port hypercall channel. Output only; reads are never answered.
pub struct HypercallPorts<O, D> {
    stdout: O,
    diag: D,
}


impl<O: Write, D: Write> HypercallPorts<O, D> {
    pub fn new(stdout: O, diag: D) -> Self {
        Self { stdout, diag }
    }

    /// Relays an `out` to `port`. Returns the channel written, if any.
    pub fn write(&mut self, port: u16, data: &[u8]) -> Result<Option<Channel>> {
        let Some(channel) = Channel::from_port(port) else {
            trace!("ignoring out to unmapped port {:#x}", port);
            return Ok(None);
        };
        debug!("hypercall {:?}: {:#x} ({} bytes)", channel, le_value(data), data.len());

        let sink: &mut dyn Write = match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Diag => &mut self.diag,
        };
        sink.write_all(data)?;
        sink.flush()?;
        Ok(Some(channel))
    }

    pub fn stdout(&self) -> &O {
        &self.stdout
    }

    pub fn diag(&self) -> &D {
        &self.diag
    }

    pub fn into_inner(self) -> (O, D) {
        (self.stdout, self.diag)
    }
}


/// Numeric form of an I/O transfer, for logging.
fn le_value(data: &[u8]) -> u64 {
    data.iter().take(8).rev().fold(0, |acc, &b| (acc << 8) | u64::from(b))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_zero_goes_to_stdout() {
        let mut ports = HypercallPorts::new(Vec::new(), Vec::new());
        assert_eq!(ports.write(0, &[0x41]).unwrap(), Some(Channel::Stdout));
        assert_eq!(ports.stdout().as_slice(), b"A");
        assert!(ports.diag().is_empty());
    }

    #[test]
    fn test_port_one_goes_to_diag() {
        let mut ports = HypercallPorts::new(Vec::new(), Vec::new());
        ports.write(1, b"ok\n\0").unwrap();
        assert_eq!(ports.diag().as_slice(), b"ok\n\0");
        assert!(ports.stdout().is_empty());
    }

    #[test]
    fn test_unmapped_port_ignored() {
        let mut ports = HypercallPorts::new(Vec::new(), Vec::new());
        assert_eq!(ports.write(5, &[0x41]).unwrap(), None);
        assert_eq!(ports.write(0x3f8, b"x").unwrap(), None);
        let (out, diag) = ports.into_inner();
        assert!(out.is_empty() && diag.is_empty());
    }

    #[test]
    fn test_multi_byte_writes_are_verbatim() {
        let mut ports = HypercallPorts::new(Vec::new(), Vec::new());
        ports.write(0, &[0x03, 0x00]).unwrap();
        ports.write(0, &[0x04, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(ports.stdout().as_slice(), &[3, 0, 4, 0, 0, 0]);
    }

    #[test]
    fn test_le_value() {
        assert_eq!(le_value(&[0x41]), 0x41);
        assert_eq!(le_value(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
        assert_eq!(le_value(&[]), 0);
    }
}
