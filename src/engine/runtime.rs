use crate::error::{BridgeError, Result};
use once_cell::sync::OnceCell;
use tokio::runtime::{Builder, Runtime};

const WORKER_THREADS: usize = 2;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Shared runtime that hosts every tunnel's engine task and usage reporter.
/// Built on first use.
pub(crate) fn shared() -> Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("tunnel-engine")
            .enable_all()
            .build()
            .map_err(|error| BridgeError::Runtime(error.to_string()))
    })
}
