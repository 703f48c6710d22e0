use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::{
    config::Config,
    database::RedisPatientStore,
    patients::{MemoryPatientStore, PatientStore},
    tokens::TokenStores,
};

pub struct State {
    pub config: Config,
    pub tokens: TokenStores,
    pub patients: Arc<dyn PatientStore>,
}

impl State {
    pub async fn new() -> Result<Arc<Self>> {
        let config = Config::load()?;

        let patients: Arc<dyn PatientStore> = match &config.redis_url {
            Some(redis_url) => Arc::new(
                RedisPatientStore::connect(redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            ),
            None => {
                info!("REDIS_URL not set, keeping patients in memory");
                Arc::new(MemoryPatientStore::default())
            }
        };

        Ok(Self::with_store(config, patients))
    }

    /// Fresh token stores around an existing patient store.
    pub fn with_store(config: Config, patients: Arc<dyn PatientStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            tokens: TokenStores::new(),
            patients,
        })
    }
}
