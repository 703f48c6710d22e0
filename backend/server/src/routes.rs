use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{self, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::AppError,
    patients::{Feedback, Patient, PatientDetails, PatientForm, PatientUpdate},
    qr::qr_data_url,
    registration::consume_registration,
    state::State,
    tokens::{EXPIRES_IN, TokenStore},
    utils::{new_patient_id, parse_optional_json},
};

type AppState = extract::State<Arc<State>>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    pub token: String,
    pub url: String,
    pub qr_image: String,
    pub expires_in: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationValidation {
    pub valid: bool,
    pub prefilled_data: PatientDetails,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSubmission {
    pub success: bool,
    pub patient: Patient,
}

#[derive(Serialize)]
pub struct PatientAccessValidation {
    pub valid: bool,
    pub patient: Patient,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummary {
    pub patient_id: String,
    pub name: String,
    pub room: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValidation {
    pub valid: bool,
    pub patient_data: Option<PatientSummary>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackTokenRequest {
    pub patient_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSubmission {
    pub patient_id: Option<String>,
    pub rating: u8,
    pub comments: Option<String>,
    pub category: Option<String>,
}

#[derive(Serialize)]
pub struct Success {
    pub success: bool,
}

/// QR rendering happens after insertion, a failure there takes the token back out.
fn issue<P: Clone>(
    store: &TokenStore<P>,
    payload: P,
    base_url: &str,
) -> Result<Json<IssueResponse>, AppError> {
    let issued = store.issue(payload, base_url)?;

    let qr_image = qr_data_url(&issued.url).map_err(|e| {
        store.delete(&issued.token);
        AppError::InternalError(Box::new(e))
    })?;

    Ok(Json(IssueResponse {
        token: issued.token,
        url: issued.url,
        qr_image,
        expires_in: EXPIRES_IN,
    }))
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn issue_registration_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<Json<IssueResponse>, AppError> {
    let prefill: PatientDetails = parse_optional_json(&body)?;

    issue(
        &state.tokens.registration,
        prefill,
        &state.config.public_base_url,
    )
}

pub async fn validate_registration_handler(
    extract::State(state): AppState,
    Path(token): Path<String>,
) -> Result<Json<RegistrationValidation>, AppError> {
    let prefilled_data = state.tokens.registration.get(&token)?;

    Ok(Json(RegistrationValidation {
        valid: true,
        prefilled_data,
    }))
}

pub async fn submit_registration_handler(
    extract::State(state): AppState,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let form: PatientForm = parse_optional_json(&body)?;

    let patient = consume_registration(
        &state.tokens.registration,
        state.patients.as_ref(),
        &token,
        form,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegistrationSubmission {
            success: true,
            patient,
        }),
    ))
}

pub async fn issue_patient_access_handler(
    extract::State(state): AppState,
    Path(patient_id): Path<String>,
) -> Result<Json<IssueResponse>, AppError> {
    if state.patients.get(&patient_id).await?.is_none() {
        return Err(AppError::PatientNotFound);
    }

    issue(
        &state.tokens.patient_access,
        patient_id,
        &state.config.public_base_url,
    )
}

pub async fn validate_patient_access_handler(
    extract::State(state): AppState,
    Path(token): Path<String>,
) -> Result<Json<PatientAccessValidation>, AppError> {
    let patient_id = state.tokens.patient_access.get(&token)?;

    // A discharged patient's links stop working even before they expire.
    let patient = state
        .patients
        .get(&patient_id)
        .await?
        .ok_or(AppError::InvalidToken)?;

    Ok(Json(PatientAccessValidation {
        valid: true,
        patient,
    }))
}

pub async fn issue_feedback_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<Json<IssueResponse>, AppError> {
    let request: FeedbackTokenRequest = parse_optional_json(&body)?;

    issue(
        &state.tokens.feedback,
        request.patient_id,
        &state.config.public_base_url,
    )
}

pub async fn validate_feedback_handler(
    extract::State(state): AppState,
    Path(token): Path<String>,
) -> Result<Json<FeedbackValidation>, AppError> {
    let patient_data = match state.tokens.feedback.get(&token)? {
        Some(patient_id) => state
            .patients
            .get(&patient_id)
            .await?
            .map(|patient| PatientSummary {
                patient_id: patient.patient_id,
                name: patient.name,
                room: patient.room,
            }),
        None => None,
    };

    Ok(Json(FeedbackValidation {
        valid: true,
        patient_data,
    }))
}

pub async fn submit_feedback_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<Json<Success>, AppError> {
    let submission: FeedbackSubmission = parse_optional_json(&body)?;

    if !(1..=5).contains(&submission.rating) {
        return Err(AppError::MalformedPayload);
    }

    let feedback = Feedback {
        rating: submission.rating,
        comments: submission.comments,
        category: submission.category,
        submitted_at: Utc::now(),
    };

    match submission.patient_id {
        Some(patient_id) => {
            if !state.patients.append_feedback(&patient_id, feedback).await? {
                return Err(AppError::PatientNotFound);
            }

            info!(%patient_id, "Feedback recorded");
        }
        None => {
            info!(
                rating = feedback.rating,
                category = feedback.category.as_deref(),
                "Anonymous feedback received"
            );
        }
    }

    Ok(Json(Success { success: true }))
}

pub async fn list_patients_handler(
    extract::State(state): AppState,
) -> Result<Json<Vec<Patient>>, AppError> {
    Ok(Json(state.patients.list().await?))
}

pub async fn create_patient_handler(
    extract::State(state): AppState,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let form: PatientForm = parse_optional_json(&body)?;

    let full_name = form
        .full_name()
        .ok_or(AppError::MissingRequiredField("name"))?;
    let patient = Patient::new(new_patient_id(), full_name, form.details.clone());

    let patient = state.patients.create(patient).await?;
    info!(patient_id = %patient.patient_id, "Patient created");

    Ok((StatusCode::CREATED, Json(patient)))
}

pub async fn get_patient_handler(
    extract::State(state): AppState,
    Path(patient_id): Path<String>,
) -> Result<Json<Patient>, AppError> {
    state
        .patients
        .get(&patient_id)
        .await?
        .map(Json)
        .ok_or(AppError::PatientNotFound)
}

pub async fn update_patient_handler(
    extract::State(state): AppState,
    Path(patient_id): Path<String>,
    body: Bytes,
) -> Result<Json<Patient>, AppError> {
    let update: PatientUpdate = parse_optional_json(&body)?;

    state
        .patients
        .update(&patient_id, update)
        .await?
        .map(Json)
        .ok_or(AppError::PatientNotFound)
}

pub async fn delete_patient_handler(
    extract::State(state): AppState,
    Path(patient_id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.patients.delete(&patient_id).await? {
        return Err(AppError::PatientNotFound);
    }

    info!(%patient_id, "Patient deleted");

    Ok(StatusCode::NO_CONTENT)
}
