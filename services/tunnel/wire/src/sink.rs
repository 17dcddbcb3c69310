//! Outbound seam shared by every component that emits frames.

use crate::{Frame, WireError};
use async_trait::async_trait;
use std::sync::Arc;

/// Destination for outbound frames (normally the tunnel link writer)
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue one frame for transmission
    async fn send_frame(&self, frame: Frame) -> Result<(), WireError>;
}

#[async_trait]
impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    async fn send_frame(&self, frame: Frame) -> Result<(), WireError> {
        (**self).send_frame(frame).await
    }
}
