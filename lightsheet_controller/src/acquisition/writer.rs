use tracing::{debug, info};

/// Sink for acquired frames, fed from the data thread.
pub trait FrameWriter: Send {
    fn write_frames(&mut self, frame_ids: &[usize]) -> anyhow::Result<()>;

    /// Flushes and closes the sink. Called once when the feature ends.
    fn cleanup(&mut self) -> anyhow::Result<()>;
}

/// Writer that records frame ids in the log instead of storing pixels.
#[derive(Debug, Default)]
pub struct TracingFrameWriter {
    written: u64,
}

impl TracingFrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameWriter for TracingFrameWriter {
    fn write_frames(&mut self, frame_ids: &[usize]) -> anyhow::Result<()> {
        self.written += frame_ids.len() as u64;
        debug!(?frame_ids, written = self.written, "Frames written");
        Ok(())
    }

    fn cleanup(&mut self) -> anyhow::Result<()> {
        info!(written = self.written, "Frame writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_written_frames() {
        let mut writer = TracingFrameWriter::new();
        writer.write_frames(&[0, 1, 2]).unwrap();
        writer.write_frames(&[]).unwrap();
        writer.write_frames(&[3]).unwrap();
        writer.cleanup().unwrap();

        assert_eq!(writer.written(), 4);
    }
}
