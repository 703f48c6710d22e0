//! # Redis
//!
//! Optional persistent backend for patient records.
//!
//! ## Requirements
//!
//! - Survive server restarts, tokens do not need to
//! - Small dataset, one entry per occupied bed
//! - O(1) lookups by patient id
//!
//! ## Implementation
//!
//! - Redis hash: 1 big key `patients`, field is the patient id, value is the record as JSON
//! - Creation uses `HSETNX` so a duplicate id never overwrites an existing record
//! - Updates read the record, change it locally, then swap it in with a compare-and-set script
//! - The swap only lands if the stored JSON is still the one that was read, otherwise retry
//! - A record deleted in the meantime fails the swap and stays deleted
use std::time::Duration;

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::{debug, info};

use crate::patients::{Feedback, Patient, PatientStore, PatientUpdate, StoreError};

pub const PATIENTS_KEY: &str = "patients";

const MAX_SWAP_ATTEMPTS: usize = 8;

// KEYS[1] hash, ARGV[1] field, ARGV[2] expected value, ARGV[3] new value.
const COMPARE_AND_SET: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
";

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(500));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

pub struct RedisPatientStore {
    connection: ConnectionManager,
    compare_and_set: Script,
}

impl RedisPatientStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let connection = init_redis(redis_url).await?;
        info!("Connected to Redis");

        Ok(Self {
            connection,
            compare_and_set: Script::new(COMPARE_AND_SET),
        })
    }

    /// Applies `change` to the stored record atomically. `None` when the patient does not exist,
    /// including when it is deleted while the change is in flight.
    async fn modify<F>(
        &self,
        patient_id: &str,
        mut change: F,
    ) -> Result<Option<Patient>, StoreError>
    where
        F: FnMut(&mut Patient) + Send,
    {
        let mut connection = self.connection.clone();

        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let raw: Option<String> = connection.hget(PATIENTS_KEY, patient_id).await?;
            let Some(current) = raw else {
                return Ok(None);
            };

            let mut patient: Patient = serde_json::from_str(&current)?;
            change(&mut patient);
            let next = serde_json::to_string(&patient)?;

            let swapped: bool = self
                .compare_and_set
                .key(PATIENTS_KEY)
                .arg(patient_id)
                .arg(&current)
                .arg(&next)
                .invoke_async(&mut connection)
                .await?;

            if swapped {
                return Ok(Some(patient));
            }

            debug!(%patient_id, attempt, "Patient changed during update, retrying");
        }

        Err(StoreError::Conflict(patient_id.to_string()))
    }
}

#[async_trait]
impl PatientStore for RedisPatientStore {
    async fn create(&self, patient: Patient) -> Result<Patient, StoreError> {
        let mut connection = self.connection.clone();
        let json = serde_json::to_string(&patient)?;

        let created: bool = connection
            .hset_nx(PATIENTS_KEY, &patient.patient_id, json)
            .await?;

        if !created {
            return Err(StoreError::Duplicate(patient.patient_id));
        }

        Ok(patient)
    }

    async fn get(&self, patient_id: &str) -> Result<Option<Patient>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.hget(PATIENTS_KEY, patient_id).await?;

        Ok(raw.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn list(&self) -> Result<Vec<Patient>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Vec<String> = connection.hvals(PATIENTS_KEY).await?;

        let mut patients = raw
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<Result<Vec<Patient>, _>>()?;
        patients.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));

        Ok(patients)
    }

    async fn update(
        &self,
        patient_id: &str,
        update: PatientUpdate,
    ) -> Result<Option<Patient>, StoreError> {
        self.modify(patient_id, |patient| update.clone().apply(patient))
            .await
    }

    async fn delete(&self, patient_id: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed: usize = connection.hdel(PATIENTS_KEY, patient_id).await?;

        Ok(removed > 0)
    }

    async fn append_feedback(
        &self,
        patient_id: &str,
        feedback: Feedback,
    ) -> Result<bool, StoreError> {
        let appended = self
            .modify(patient_id, |patient| patient.feedback.push(feedback.clone()))
            .await?;

        Ok(appended.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{patients::PatientDetails, utils::new_patient_id};

    async fn store() -> RedisPatientStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisPatientStore::connect(&url).await.unwrap()
    }

    fn feedback(rating: u8) -> Feedback {
        Feedback {
            rating,
            comments: None,
            category: None,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a Redis server, set REDIS_URL"]
    async fn test_concurrent_appends_all_land() {
        let store = Arc::new(store().await);
        let patient_id = new_patient_id();
        store
            .create(Patient::new(
                patient_id.clone(),
                "Ann Lee",
                PatientDetails::default(),
            ))
            .await
            .unwrap();

        let appends: Vec<_> = (1..=5)
            .map(|rating| {
                let store = store.clone();
                let patient_id = patient_id.clone();

                tokio::spawn(async move {
                    store.append_feedback(&patient_id, feedback(rating)).await
                })
            })
            .collect();

        for append in appends {
            assert!(append.await.unwrap().unwrap());
        }

        let patient = store.get(&patient_id).await.unwrap().unwrap();
        assert_eq!(patient.feedback.len(), 5);

        assert!(store.delete(&patient_id).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server, set REDIS_URL"]
    async fn test_change_after_delete_stays_deleted() {
        let store = store().await;
        let patient_id = new_patient_id();
        store
            .create(Patient::new(
                patient_id.clone(),
                "John Smith",
                PatientDetails::default(),
            ))
            .await
            .unwrap();
        assert!(store.delete(&patient_id).await.unwrap());

        assert!(!store.append_feedback(&patient_id, feedback(4)).await.unwrap());
        assert!(
            store
                .update(&patient_id, PatientUpdate::default())
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.get(&patient_id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "needs a Redis server, set REDIS_URL"]
    async fn test_stale_swap_rejected() {
        let store = store().await;
        let patient_id = new_patient_id();
        let patient = store
            .create(Patient::new(
                patient_id.clone(),
                "Mary Ann Lee",
                PatientDetails::default(),
            ))
            .await
            .unwrap();
        let stale = serde_json::to_string(&patient).unwrap();

        store
            .append_feedback(&patient_id, feedback(5))
            .await
            .unwrap();

        let mut connection = store.connection.clone();
        let swapped: bool = store
            .compare_and_set
            .key(PATIENTS_KEY)
            .arg(&patient_id)
            .arg(&stale)
            .arg(&stale)
            .invoke_async(&mut connection)
            .await
            .unwrap();
        assert!(!swapped);

        let stored = store.get(&patient_id).await.unwrap().unwrap();
        assert_eq!(stored.feedback.len(), 1);

        assert!(store.delete(&patient_id).await.unwrap());
    }
}
