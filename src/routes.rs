use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::{self, AuthUser, RefreshUser, TokenType},
    error::ApiError,
    pipeline::ClassificationResult,
    store::{Notification, ProfileUpdate, StoreError},
    AppState,
};

const PROCESSING_FAILED: &str = "An error occurred while processing the image";
const INVALID_CREDENTIALS: &str = "Invalid email or password";

fn malformed_upload(err: MultipartError) -> ApiError {
    tracing::warn!("Malformed multipart body: {}", err);
    ApiError::new(StatusCode::BAD_REQUEST, "Malformed upload")
}

/// The `file` field of a multipart upload.
struct Upload {
    filename: String,
    data: Bytes,
}

impl Upload {
    async fn from_multipart(multipart: &mut Multipart) -> Result<Option<Self>, ApiError> {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(malformed_upload)?
        {
            if field.name() == Some("file") {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(malformed_upload)?;
                return Ok(Some(Upload { filename, data }));
            }
        }
        Ok(None)
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "model_ready": state.classifier.host().is_ready(),
    }))
}

pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<ClassificationResult>, ApiError> {
    let Upload { filename, data } = Upload::from_multipart(&mut multipart)
        .await?
        .ok_or_else(|| ApiError::bad_request("No file uploaded"))?;

    let classifier = state.classifier.clone();
    let name = filename.clone();
    let result = tokio::task::spawn_blocking(move || classifier.classify(&data, &name))
        .await
        .map_err(|err| ApiError::internal(err, PROCESSING_FAILED))??;

    state
        .store
        .record_prediction(&user.user_id, &result, &filename)
        .await
        .map_err(|err| ApiError::internal(err, PROCESSING_FAILED))?;

    tracing::info!(
        user = %user.user_id,
        diagnosis = %result.label,
        confidence = result.confidence,
        "Prediction stored"
    );
    Ok(Json(result))
}

pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let history = state
        .store
        .history(&user.user_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load history"))?;
    Ok(Json(json!({ "history": history })))
}

pub async fn notifications_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let notifications = state
        .store
        .notifications(&user.user_id)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to load notifications"))?;
    Ok(Json(notifications))
}

pub async fn disease_handler(
    State(state): State<Arc<AppState>>,
    Path(disease_name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let information = state
        .disease_info
        .describe(&disease_name)
        .await
        .map_err(|err| ApiError::internal(err, "Disease information is currently unavailable"))?;

    Ok(Json(json!({
        "status": "success",
        "disease": disease_name,
        "information": information,
    })))
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl Credentials {
    /// Normalised email and the raw password, if both were sent.
    fn into_parts(self) -> Option<(String, String)> {
        let email = self.email?.trim().to_lowercase();
        Some((email, self.password?))
    }
}

pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (email, password) = credentials
        .into_parts()
        .ok_or_else(|| ApiError::bad_request("Email and password are required"))?;

    if !valid_email(&email) {
        return Err(ApiError::bad_request("Invalid email format"));
    }
    if !valid_password(&password) {
        return Err(ApiError::bad_request(
            "Password must be at least 8 characters and include both letters and numbers",
        ));
    }

    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|err| ApiError::internal(err, "Unable to create user"))?
        .map_err(|err| ApiError::internal(err, "Unable to create user"))?;

    match state.store.create_user(&email, &hash).await {
        Ok(user) => {
            tracing::info!(user = user.id, "User registered");
            Ok((
                StatusCode::CREATED,
                Json(json!({ "message": "User created successfully" })),
            ))
        }
        Err(StoreError::EmailTaken) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Email already registered",
        )),
        Err(err) => Err(ApiError::internal(err, "Unable to create user")),
    }
}

pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<Value>, ApiError> {
    let (email, password) = credentials
        .into_parts()
        .ok_or_else(|| ApiError::bad_request("Email and password required"))?;

    let user = state
        .store
        .user_by_email(&email)
        .await
        .map_err(|err| ApiError::internal(err, "Login failed"))?
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, INVALID_CREDENTIALS))?;

    let hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(|err| ApiError::internal(err, "Login failed"))?;
    if !matches {
        tracing::warn!(user = user.id, "Wrong password");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, INVALID_CREDENTIALS));
    }

    state
        .store
        .record_login(user.id)
        .await
        .map_err(|err| ApiError::internal(err, "Login failed"))?;

    let subject = user.id.to_string();
    let access_token = state
        .tokens
        .issue(&subject, TokenType::Access)
        .map_err(|err| ApiError::internal(err, "Login failed"))?;
    let refresh_token = state
        .tokens
        .issue(&subject, TokenType::Refresh)
        .map_err(|err| ApiError::internal(err, "Login failed"))?;

    Ok(Json(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "user_id": user.id,
        "email": user.email,
    })))
}

pub async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    user: RefreshUser,
) -> Result<Json<Value>, ApiError> {
    let access_token = state
        .tokens
        .issue(&user.user_id, TokenType::Access)
        .map_err(|err| ApiError::internal(err, "Token refresh failed"))?;
    Ok(Json(json!({ "access_token": access_token })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

pub async fn profile_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<ProfileRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.name.is_none() && request.phone.is_none() {
        return Err(ApiError::bad_request("Invalid input data"));
    }

    let name = match request.name {
        Some(name) if name.trim().is_empty() => return Err(ApiError::bad_request("Invalid name")),
        Some(name) => Some(name.trim().to_string()),
        None => None,
    };
    if let Some(phone) = &request.phone {
        if !valid_phone(phone) {
            return Err(ApiError::bad_request("Invalid phone number format"));
        }
    }

    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "User not found");
    let id: i64 = user.user_id.parse().map_err(|_| not_found())?;
    let update = ProfileUpdate {
        name,
        phone: request.phone,
    };
    state
        .store
        .update_profile(id, &update)
        .await
        .map_err(|err| ApiError::internal(err, "Failed to update profile"))?
        .ok_or_else(not_found)?;

    Ok(Json(json!({ "message": "Profile updated" })))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// `local@domain.tld`, where the parts hold word characters, dots and dashes
/// and the tld is word characters only.
fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let part_ok = |part: &str| {
        !part.is_empty() && part.chars().all(|c| is_word_char(c) || c == '.' || c == '-')
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    part_ok(local) && part_ok(host) && !tld.is_empty() && tld.chars().all(is_word_char)
}

/// At least 8 characters with at least one letter and one digit.
fn valid_password(password: &str) -> bool {
    password.chars().count() >= 8
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

/// Optional leading `+`, then 7 to 15 digits.
fn valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
