use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;

use heater_common::{PersistedControl, RuntimeConfig};

/// File-backed persistence under `HEATER_DATA_DIR`.
#[derive(Clone)]
pub struct StateStore {
    runtime_path: Arc<PathBuf>,
    control_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("HEATER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heater"));
        Self::new(data_dir)
    }

    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            control_path: Arc::new(data_dir.join("state.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn load_control(&self) -> anyhow::Result<Option<PersistedControl>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.control_path.as_ref()).await {
            Ok(raw) => Ok(Some(serde_json::from_slice::<PersistedControl>(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_control(&self, control: &PersistedControl) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.control_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(control)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}
