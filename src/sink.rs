use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use tracing::{error, info, trace};

use crate::recording::DataCallback;

/// Writes recorded samples to a file or stdout until a sample budget is spent
///
/// Each byte is one sample of all eight channels.
pub struct SampleSink<W: Write> {
    writer: W,
    remaining: u64,
    written: u64,
    chunks: u64,
    error: Option<io::Error>,
}

impl SampleSink<Box<dyn Write>> {
    /// Open `path` for writing; `-` means stdout
    pub fn open(path: &str, n_samples: u64) -> Result<Self> {
        let writer: Box<dyn Write> = if path == "-" {
            info!("Writing {} samples to stdout", n_samples);
            Box::new(BufWriter::new(io::stdout().lock()))
        } else {
            info!("Writing {} samples to {}", n_samples, path);
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file {}", path))?;
            Box::new(BufWriter::new(file))
        };
        Ok(Self::new(writer, n_samples))
    }
}

impl<W: Write> SampleSink<W> {
    pub fn new(writer: W, n_samples: u64) -> Self {
        Self {
            writer,
            remaining: n_samples,
            written: 0,
            chunks: 0,
            error: None,
        }
    }

    /// Samples written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Samples still wanted
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Flush the writer and report any write error hit while recording
    pub fn finish(mut self) -> Result<(u64, W)> {
        if let Some(e) = self.error.take() {
            return Err(e).context("Failed to write samples");
        }
        self.writer.flush().context("Failed to flush samples")?;
        Ok((self.written, self.writer))
    }
}

impl<W: Write> DataCallback for SampleSink<W> {
    fn on_data(&mut self, chunk: &[u8]) -> bool {
        if self.error.is_some() || self.remaining == 0 {
            return false;
        }

        let take = chunk.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        if let Err(e) = self.writer.write_all(&chunk[..take]) {
            error!("Failed to write samples: {}", e);
            self.error = Some(e);
            return false;
        }

        self.chunks += 1;
        self.remaining -= take as u64;
        self.written += take as u64;

        trace!(
            "Chunk #{}: {} bytes, {} samples written, more: {}",
            self.chunks,
            chunk.len(),
            self.written,
            self.remaining > 0
        );

        self.remaining > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_truncates_to_budget() {
        let mut sink = SampleSink::new(Vec::new(), 10);

        assert!(sink.on_data(&[1, 2, 3, 4]));
        assert!(!sink.on_data(&[5, 6, 7, 8, 9, 10, 11, 12]));

        let (written, bytes) = sink.finish().unwrap();
        assert_eq!(written, 10);
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_sink_accepts_empty_chunks() {
        let mut sink = SampleSink::new(Vec::new(), 4);
        assert!(sink.on_data(&[]));
        assert_eq!(sink.remaining(), 4);
    }

    #[test]
    fn test_sink_stops_on_write_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sink = SampleSink::new(Broken, 100);
        assert!(!sink.on_data(&[0; 8]));
        assert!(!sink.on_data(&[0; 8]));
        assert!(sink.finish().is_err());
    }
}
