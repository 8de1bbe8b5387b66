//! Memoized engine construction.
//!
//! The first `get_engine` call resolves the device and loads the model; every
//! later call gets the same `Arc<EngineHandle>`. Concurrent first calls wait
//! on a single initialization. A failed load leaves the cell empty, so the
//! next caller starts a fresh attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::device::{device_label, resolve_device, DevicePreference};
use crate::inference::engine::EngineHandle;
use crate::inference::model_loader::{ModelLoadError, ModelSource, ModelSpec};

pub struct EngineLoader {
    source: Arc<dyn ModelSource>,
    spec: ModelSpec,
    device: DevicePreference,
    cell: OnceCell<Arc<EngineHandle>>,
    attempts: AtomicUsize,
}

impl EngineLoader {
    pub fn new(source: Arc<dyn ModelSource>, spec: ModelSpec, device: DevicePreference) -> Self {
        Self {
            source,
            spec,
            device,
            cell: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Return the shared engine, loading it on first use.
    pub async fn get_engine(&self) -> Result<Arc<EngineHandle>, ModelLoadError> {
        self.cell
            .get_or_try_init(|| self.load())
            .await
            .map(Arc::clone)
    }

    /// The engine if it has already been loaded; never triggers a load.
    pub fn loaded(&self) -> Option<Arc<EngineHandle>> {
        self.cell.get().cloned()
    }

    /// Number of load attempts started, successful or not.
    pub fn load_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn load(&self) -> Result<Arc<EngineHandle>, ModelLoadError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();

        let device = resolve_device(self.device)?;
        let label = device_label(&device);
        info!(
            model = self.spec.id,
            revision = self.spec.revision,
            device = label,
            attempt,
            "Loading model"
        );

        match self.source.load_model(&self.spec, &device).await {
            Ok(loaded) => {
                info!(
                    model = self.spec.id,
                    device = label,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                Ok(Arc::new(EngineHandle::new(
                    self.spec.id.clone(),
                    label,
                    loaded.tokenizer,
                    loaded.generator,
                )))
            }
            Err(e) => {
                error!(model = self.spec.id, attempt, "Model load failed: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::StubModelSource;

    fn loader(source: &StubModelSource) -> EngineLoader {
        EngineLoader::new(
            Arc::new(source.clone()),
            ModelSpec::new("stub/model", "main"),
            DevicePreference::Cpu,
        )
    }

    #[tokio::test]
    async fn test_second_call_reuses_handle() {
        let source = StubModelSource::new();
        let loader = loader(&source);
        assert!(loader.loaded().is_none());

        let a = loader.get_engine().await.unwrap();
        let b = loader.get_engine().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.loads(), 1);
        assert_eq!(loader.load_attempts(), 1);
        assert_eq!(a.device(), "cpu");
        assert_eq!(a.model_id(), "stub/model");
    }
}
