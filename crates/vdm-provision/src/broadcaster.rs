use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Write-side fan-out to a growable set of sinks.
///
/// Every write is delivered whole, in write order, to every sink registered
/// at the time of the write. Sinks may be added concurrently with in-flight
/// writes; a sink added mid-write may miss that write but sees all
/// subsequent ones. A sink whose own write fails is dropped from the set.
#[derive(Clone, Default)]
pub struct Broadcaster {
    sinks: Arc<Mutex<Vec<Box<dyn Write + Send>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sink: Box<dyn Write + Send>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

impl Write for Broadcaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain_mut(|sink| sink.write_all(buf).is_ok());
        // The broadcast itself cannot fail; a dead sink only drops itself.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sinks = self.sinks.lock().unwrap();
        sinks.retain_mut(|sink| sink.flush().is_ok());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::SharedBuf;

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_all_sinks_receive_writes_in_order() {
        let mut b = Broadcaster::new();
        let first = SharedBuf::default();
        let second = SharedBuf::default();
        b.add(Box::new(first.clone()));
        b.add(Box::new(second.clone()));

        b.write_all(b"alpha\n").unwrap();
        b.write_all(b"beta\n").unwrap();

        assert_eq!(first.contents(), "alpha\nbeta\n");
        assert_eq!(second.contents(), "alpha\nbeta\n");
    }

    #[test]
    fn test_late_sink_sees_only_subsequent_writes() {
        let mut b = Broadcaster::new();
        let early = SharedBuf::default();
        b.add(Box::new(early.clone()));
        b.write_all(b"alpha\n").unwrap();

        let late = SharedBuf::default();
        b.add(Box::new(late.clone()));
        b.write_all(b"beta\n").unwrap();

        assert_eq!(early.contents(), "alpha\nbeta\n");
        assert_eq!(late.contents(), "beta\n");
    }

    #[test]
    fn test_failing_sink_is_dropped_not_fatal() {
        let mut b = Broadcaster::new();
        let healthy = SharedBuf::default();
        b.add(Box::new(FailingSink));
        b.add(Box::new(healthy.clone()));

        b.write_all(b"alpha\n").unwrap();
        assert_eq!(b.sink_count(), 1);
        b.write_all(b"beta\n").unwrap();
        assert_eq!(healthy.contents(), "alpha\nbeta\n");
    }

    #[test]
    fn test_write_with_no_sinks_is_ok() {
        let mut b = Broadcaster::new();
        b.write_all(b"nobody listening\n").unwrap();
    }
}
