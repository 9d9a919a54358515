// Passthrough separation - hands the original mix back as the drum stem

use std::path::Path;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{ProgressCallback, SeparationBackend, SeparationCapability, SeparationOutput};
use crate::error::BackendError;

/// Always-available backend used when no separation model can run
#[derive(Debug, Clone, Default)]
pub struct PassthroughSeparation;

impl PassthroughSeparation {
    pub fn new() -> Self {
        Self
    }
}

impl SeparationBackend for PassthroughSeparation {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn probe(&self) -> SeparationCapability {
        SeparationCapability::Available
    }

    fn load_model<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        async { Ok(()) }.boxed()
    }

    fn separate<'a>(
        &'a self,
        audio_path: &'a Path,
        cancel: &'a CancellationToken,
        progress: ProgressCallback,
    ) -> BoxFuture<'a, Result<SeparationOutput, BackendError>> {
        async move {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            progress(1.0);
            Ok(SeparationOutput {
                drums_path: audio_path.to_path_buf(),
                is_passthrough: true,
            })
        }
        .boxed()
    }
}
