use std::io::{self, Write};

/// Sink that forwards complete lines to the tracing subscriber.
///
/// Used as the default observer for driver-launched provisioning tasks so
/// bootstrap output lands in the service log instead of a raw stdout handle.
pub struct TracingSink {
    machine_id: String,
    buf: Vec<u8>,
}

impl TracingSink {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            buf: Vec::new(),
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            tracing::info!(
                target: "vdm::provision",
                machine_id = %self.machine_id,
                "{}",
                text.trim_end(),
            );
        }
    }
}

impl Write for TracingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.drain_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf).to_string();
            tracing::info!(
                target: "vdm::provision",
                machine_id = %self.machine_id,
                "{}",
                text.trim_end(),
            );
            self.buf.clear();
        }
        Ok(())
    }
}

impl Drop for TracingSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_line_buffers_until_newline() {
        let mut sink = TracingSink::new("srv-1");
        sink.write_all(b"installing").unwrap();
        assert_eq!(sink.buf, b"installing");
        sink.write_all(b" agent\n").unwrap();
        assert!(sink.buf.is_empty());
    }

    #[test]
    fn test_flush_clears_trailing_partial_line() {
        let mut sink = TracingSink::new("srv-1");
        sink.write_all(b"no newline").unwrap();
        sink.flush().unwrap();
        assert!(sink.buf.is_empty());
    }
}
