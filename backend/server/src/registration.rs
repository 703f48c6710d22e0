//! # Registration
//!
//! Staff issue a registration token with whatever details they already know. The patient scans the
//! QR code, completes the form on their own device, and submitting it turns the token into a
//! patient record.
//!
//! ## Consuming a token
//! 1. Claim the token, nobody else can consume it while the claim is held
//! 2. Require a non-blank name, otherwise drop the claim and reject
//! 3. Build the patient: initials only, form fields first, then prefill, then defaults
//! 4. Write the patient, outside the token lock
//! 5. Commit the claim on success, which deletes the token
//!
//! Any early return, panic or cancelled request drops the claim before step 5, which puts the
//! token back for another attempt.
use tracing::{error, info, warn};

use crate::{
    error::AppError,
    patients::{Patient, PatientDetails, PatientForm, PatientStore},
    tokens::TokenStore,
    utils::{new_patient_id, redact},
};

pub async fn consume_registration(
    tokens: &TokenStore<PatientDetails>,
    patients: &dyn PatientStore,
    token: &str,
    form: PatientForm,
) -> Result<Patient, AppError> {
    let claim = tokens.claim(token).map_err(|e| {
        warn!(token = redact(token), "Registration rejected: {e}");
        AppError::InvalidOrExpired
    })?;

    let Some(full_name) = form.full_name().map(str::to_owned) else {
        warn!(token = redact(token), "Registration rejected: missing name");
        return Err(AppError::MissingRequiredField("name"));
    };

    let patient = Patient::new(
        new_patient_id(),
        &full_name,
        form.details.or(claim.payload()),
    );

    let patient = patients.create(patient).await.map_err(|e| {
        error!(token = redact(token), "Failed to create registered patient: {e}");
        AppError::Persistence(e)
    })?;

    claim.commit();
    info!(
        token = redact(token),
        patient_id = %patient.patient_id,
        "Registration token consumed"
    );

    Ok(patient)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use crate::{
        patients::{Feedback, MemoryPatientStore, PatientUpdate, StoreError},
        tokens::TokenKind,
    };

    const BASE: &str = "http://localhost:3000";

    struct FailingStore;

    fn broken() -> StoreError {
        StoreError::Serialization(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
    }

    #[async_trait]
    impl PatientStore for FailingStore {
        async fn create(&self, _patient: Patient) -> Result<Patient, StoreError> {
            Err(broken())
        }

        async fn get(&self, _patient_id: &str) -> Result<Option<Patient>, StoreError> {
            Err(broken())
        }

        async fn list(&self) -> Result<Vec<Patient>, StoreError> {
            Err(broken())
        }

        async fn update(
            &self,
            _patient_id: &str,
            _update: PatientUpdate,
        ) -> Result<Option<Patient>, StoreError> {
            Err(broken())
        }

        async fn delete(&self, _patient_id: &str) -> Result<bool, StoreError> {
            Err(broken())
        }

        async fn append_feedback(
            &self,
            _patient_id: &str,
            _feedback: Feedback,
        ) -> Result<bool, StoreError> {
            Err(broken())
        }
    }

    /// Never finishes a write, like a Redis connection that hangs.
    struct StalledStore;

    #[async_trait]
    impl PatientStore for StalledStore {
        async fn create(&self, _patient: Patient) -> Result<Patient, StoreError> {
            std::future::pending().await
        }

        async fn get(&self, _patient_id: &str) -> Result<Option<Patient>, StoreError> {
            Err(broken())
        }

        async fn list(&self) -> Result<Vec<Patient>, StoreError> {
            Err(broken())
        }

        async fn update(
            &self,
            _patient_id: &str,
            _update: PatientUpdate,
        ) -> Result<Option<Patient>, StoreError> {
            Err(broken())
        }

        async fn delete(&self, _patient_id: &str) -> Result<bool, StoreError> {
            Err(broken())
        }

        async fn append_feedback(
            &self,
            _patient_id: &str,
            _feedback: Feedback,
        ) -> Result<bool, StoreError> {
            Err(broken())
        }
    }

    fn form(name: Option<&str>, room: Option<&str>) -> PatientForm {
        PatientForm {
            name: name.map(str::to_string),
            details: PatientDetails {
                room: room.map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn prefilled_store() -> (TokenStore<PatientDetails>, String) {
        let tokens = TokenStore::new(TokenKind::Registration);
        let prefill = PatientDetails {
            doctor: Some("Dr. Johnson".to_string()),
            ..Default::default()
        };
        let issued = tokens.issue(prefill, BASE).unwrap();

        (tokens, issued.token)
    }

    #[tokio::test]
    async fn test_consume_creates_patient() {
        let (tokens, token) = prefilled_store();
        let patients = MemoryPatientStore::default();

        let patient = consume_registration(
            &tokens,
            &patients,
            &token,
            form(Some("Alice Young"), Some("205A")),
        )
        .await
        .unwrap();

        assert_eq!(patient.name, "A.Y.");
        assert_eq!(patient.room, "205A");
        assert_eq!(patient.doctor.as_deref(), Some("Dr. Johnson"));
        assert!(patient.schedule.is_empty());
        assert!(patient.feedback.is_empty());
        assert!(tokens.get(&token).is_err());

        let stored = patients.get(&patient.patient_id).await.unwrap();
        assert_eq!(stored, Some(patient));
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let (tokens, token) = prefilled_store();
        let patients = MemoryPatientStore::default();

        consume_registration(&tokens, &patients, &token, form(Some("Maria"), None))
            .await
            .unwrap();

        let second =
            consume_registration(&tokens, &patients, &token, form(Some("Maria"), None)).await;

        assert!(matches!(second, Err(AppError::InvalidOrExpired)));
        assert_eq!(patients.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_name_keeps_token() {
        let (tokens, token) = prefilled_store();
        let patients = MemoryPatientStore::default();

        for name in [None, Some(""), Some("   ")] {
            let result = consume_registration(&tokens, &patients, &token, form(name, None)).await;
            assert!(matches!(result, Err(AppError::MissingRequiredField("name"))));
        }

        assert!(tokens.get(&token).is_ok());
        assert!(
            consume_registration(&tokens, &patients, &token, form(Some("Madonna"), None))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_token_checked_first() {
        let tokens = TokenStore::new(TokenKind::Registration);
        let patients = MemoryPatientStore::default();

        let result = consume_registration(&tokens, &patients, "missing", form(None, None)).await;

        assert!(matches!(result, Err(AppError::InvalidOrExpired)));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_token() {
        let (tokens, token) = prefilled_store();

        let result =
            consume_registration(&tokens, &FailingStore, &token, form(Some("Ann Lee"), None))
                .await;
        assert!(matches!(result, Err(AppError::Persistence(_))));

        let prefill = tokens.get(&token).unwrap();
        assert_eq!(prefill.doctor.as_deref(), Some("Dr. Johnson"));

        let patients = MemoryPatientStore::default();
        let patient = consume_registration(&tokens, &patients, &token, form(Some("Ann Lee"), None))
            .await
            .unwrap();
        assert_eq!(patient.name, "A.L.");
    }

    #[tokio::test]
    async fn test_cancelled_write_keeps_token() {
        let (tokens, token) = prefilled_store();

        let stalled = timeout(
            Duration::from_millis(50),
            consume_registration(&tokens, &StalledStore, &token, form(Some("Ann Lee"), None)),
        )
        .await;
        assert!(stalled.is_err());

        // The dropped request must not leave the token claimed.
        let patients = MemoryPatientStore::default();
        let patient = consume_registration(&tokens, &patients, &token, form(Some("Ann Lee"), None))
            .await
            .unwrap();
        assert_eq!(patient.doctor.as_deref(), Some("Dr. Johnson"));
        assert!(tokens.get(&token).is_err());
    }
}
