//! # Patients
//!
//! Bedside patient records. Registration tokens materialize into these, patient access tokens
//! point at them.
//!
//! ## Privacy
//! Only the initials of a patient's name are ever stored. The full name submitted by a form is
//! reduced before the record is built.
//!
//! ## Backends
//! - [`MemoryPatientStore`]: default, lost on restart
//! - [`RedisPatientStore`](crate::database::RedisPatientStore): used when `REDIS_URL` is set
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::utils::initials;

pub const DEFAULT_ROOM: &str = "Unassigned";
pub const DEFAULT_LANGUAGE: &str = "English";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Patient {0} already exists")]
    Duplicate(String),

    #[error("Patient {0} kept changing underneath the update")]
    Conflict(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleItem {
    pub time: String,
    pub activity: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub rating: u8,
    pub comments: Option<String>,
    pub category: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub patient_id: String,
    /// Initials only, see [`initials`].
    pub name: String,
    pub room: String,
    pub doctor: Option<String>,
    pub nurse: Option<String>,
    pub dietary_restrictions: Option<String>,
    pub language: String,
    pub admission_date: DateTime<Utc>,
    pub schedule: Vec<ScheduleItem>,
    pub feedback: Vec<Feedback>,
}

/// Care team and preference fields shared by registration prefill and patient forms.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doctor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nurse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dietary_restrictions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl PatientDetails {
    /// Keeps every non-blank field of `self`, fills the rest from `fallback`.
    pub fn or(self, fallback: &PatientDetails) -> PatientDetails {
        PatientDetails {
            room: present(self.room).or_else(|| present(fallback.room.clone())),
            doctor: present(self.doctor).or_else(|| present(fallback.doctor.clone())),
            nurse: present(self.nurse).or_else(|| present(fallback.nurse.clone())),
            dietary_restrictions: present(self.dietary_restrictions)
                .or_else(|| present(fallback.dietary_restrictions.clone())),
            language: present(self.language).or_else(|| present(fallback.language.clone())),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatientForm {
    pub name: Option<String>,
    #[serde(flatten)]
    pub details: PatientDetails,
}

impl PatientForm {
    /// Trimmed full name, `None` when absent or blank.
    pub fn full_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatientUpdate {
    pub name: Option<String>,
    #[serde(flatten)]
    pub details: PatientDetails,
    pub schedule: Option<Vec<ScheduleItem>>,
}

impl PatientUpdate {
    pub fn apply(self, patient: &mut Patient) {
        if let Some(name) = present(self.name) {
            patient.name = initials(&name);
        }
        if let Some(room) = present(self.details.room) {
            patient.room = room;
        }
        if let Some(doctor) = present(self.details.doctor) {
            patient.doctor = Some(doctor);
        }
        if let Some(nurse) = present(self.details.nurse) {
            patient.nurse = Some(nurse);
        }
        if let Some(dietary) = present(self.details.dietary_restrictions) {
            patient.dietary_restrictions = Some(dietary);
        }
        if let Some(language) = present(self.details.language) {
            patient.language = language;
        }
        if let Some(schedule) = self.schedule {
            patient.schedule = schedule;
        }
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Patient {
    pub fn new(patient_id: String, full_name: &str, details: PatientDetails) -> Self {
        Self {
            patient_id,
            name: initials(full_name),
            room: present(details.room).unwrap_or_else(|| DEFAULT_ROOM.to_string()),
            doctor: present(details.doctor),
            nurse: present(details.nurse),
            dietary_restrictions: present(details.dietary_restrictions),
            language: present(details.language).unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            admission_date: Utc::now(),
            schedule: Vec::new(),
            feedback: Vec::new(),
        }
    }
}

#[async_trait]
pub trait PatientStore: Send + Sync {
    async fn create(&self, patient: Patient) -> Result<Patient, StoreError>;

    async fn get(&self, patient_id: &str) -> Result<Option<Patient>, StoreError>;

    /// Sorted by patient id.
    async fn list(&self) -> Result<Vec<Patient>, StoreError>;

    async fn update(
        &self,
        patient_id: &str,
        update: PatientUpdate,
    ) -> Result<Option<Patient>, StoreError>;

    async fn delete(&self, patient_id: &str) -> Result<bool, StoreError>;

    async fn append_feedback(&self, patient_id: &str, feedback: Feedback)
    -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct MemoryPatientStore {
    patients: RwLock<HashMap<String, Patient>>,
}

#[async_trait]
impl PatientStore for MemoryPatientStore {
    async fn create(&self, patient: Patient) -> Result<Patient, StoreError> {
        let mut patients = self.patients.write().await;

        if patients.contains_key(&patient.patient_id) {
            return Err(StoreError::Duplicate(patient.patient_id));
        }

        patients.insert(patient.patient_id.clone(), patient.clone());

        Ok(patient)
    }

    async fn get(&self, patient_id: &str) -> Result<Option<Patient>, StoreError> {
        Ok(self.patients.read().await.get(patient_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Patient>, StoreError> {
        let mut patients: Vec<Patient> = self.patients.read().await.values().cloned().collect();
        patients.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));

        Ok(patients)
    }

    async fn update(
        &self,
        patient_id: &str,
        update: PatientUpdate,
    ) -> Result<Option<Patient>, StoreError> {
        let mut patients = self.patients.write().await;

        Ok(patients.get_mut(patient_id).map(|patient| {
            update.apply(patient);
            patient.clone()
        }))
    }

    async fn delete(&self, patient_id: &str) -> Result<bool, StoreError> {
        Ok(self.patients.write().await.remove(patient_id).is_some())
    }

    async fn append_feedback(
        &self,
        patient_id: &str,
        feedback: Feedback,
    ) -> Result<bool, StoreError> {
        let mut patients = self.patients.write().await;

        Ok(patients
            .get_mut(patient_id)
            .map(|patient| patient.feedback.push(feedback))
            .is_some())
    }
}
