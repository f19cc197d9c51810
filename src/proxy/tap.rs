//! Observability taps for relayed bytes.

use std::fmt::Write;

use tracing::info;

/// Sees every chunk a relay forwards, before it is written onward.
///
/// A tap only observes: the relay always forwards the chunk unchanged.
pub trait Tap: Send + Sync {
    fn observe(&self, label: &str, data: &[u8]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTap;

impl Tap for NoopTap {
    fn observe(&self, _label: &str, _data: &[u8]) {}
}

/// Logs each chunk as a canonical hex dump under its label.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexDumpTap;

impl Tap for HexDumpTap {
    fn observe(&self, label: &str, data: &[u8]) {
        info!("{}:\n{}", label, hex_dump(data));
    }
}

/// Formats bytes as offset, sixteen hex columns split in two groups of
/// eight, and the printable ASCII rendering.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(16) * 79);
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for column in 0..16 {
            match chunk.get(column) {
                Some(byte) => {
                    let _ = write!(out, "{:02x} ", byte);
                }
                None => out.push_str("   "),
            }
            if column == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &byte in chunk {
            out.push(if byte == b' ' || byte.is_ascii_graphic() {
                byte as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_row() {
        assert_eq!(
            hex_dump(b"0123456789abcdef"),
            "00000000  30 31 32 33 34 35 36 37  38 39 61 62 63 64 65 66  |0123456789abcdef|\n"
        );
    }

    /// A short trailing row is padded so the ASCII column stays aligned.
    #[test]
    fn partial_row_is_padded() {
        let dump = hex_dump(b"0123456789abcdefGET /\r\n");
        let rows: Vec<&str> = dump.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), rows[1].len() + 16 - 7);
        assert!(rows[1].starts_with("00000010  47 45 54 20 2f 0d 0a "));
        assert!(rows[1].ends_with("|GET /..|"));
    }

    #[test]
    fn empty_input() {
        assert_eq!(hex_dump(b""), "");
    }
}
