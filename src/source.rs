//! Frame source trait for the pipeline

use tokio::io::AsyncRead;

use crate::frame::{Frame, FrameReader};
use crate::Result;

/// Anything that yields complete frames from the analyzer.
///
/// The pipeline owns its source and pulls one frame at a time. Sources
/// never resynchronise: an error is the end of the stream.
#[async_trait::async_trait]
pub trait FrameSource: Send + 'static {
    /// Get the next frame
    ///
    /// Returns:
    /// - `Ok(frame)` - a complete frame
    /// - `Err(e)` - the stream is broken or desynchronised
    async fn next_frame(&mut self) -> Result<Frame>;

    /// Frames delivered so far
    fn frames_read(&self) -> u64;
}

#[async_trait::async_trait]
impl<R> FrameSource for FrameReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Result<Frame> {
        self.read_frame().await
    }

    fn frames_read(&self) -> u64 {
        FrameReader::frames_read(self)
    }
}
