use std::io::Cursor;
use std::path::Path;

use crate::device::DeviceControl;
use crate::errors::{DroidClawError, DroidClawResult};
use crate::perception::types::{Frame, FrameMeta};

/// Captures the current screen through the device and loads it as a [`Frame`].
pub async fn capture_frame(device: &dyn DeviceControl) -> DroidClawResult<Frame> {
    let path = device.capture_screen_to_file().await?;
    load_frame(&path).await
}

/// Reads a PNG from disk and probes its dimensions without decoding pixels.
pub async fn load_frame(path: &Path) -> DroidClawResult<Frame> {
    let png = tokio::fs::read(path).await?;
    if png.is_empty() {
        return Err(DroidClawError::Perception(format!(
            "captured frame {} is empty",
            path.display()
        )));
    }
    let (width, height) = image::ImageReader::new(Cursor::new(&png))
        .with_guessed_format()?
        .into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(DroidClawError::Perception("captured frame has zero size".into()));
    }

    tracing::debug!(path = %path.display(), width, height, bytes = png.len(), "frame captured");
    Ok(Frame {
        png,
        meta: FrameMeta {
            width,
            height,
            captured_at: chrono::Utc::now(),
        },
    })
}
