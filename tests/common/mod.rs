#![allow(dead_code)]

use std::{io::Cursor, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use tower::ServiceExt;

use diagnosis_service::{
    auth::{TokenKeys, TokenType},
    construct_router,
    disease_info::{DiseaseInfo, DiseaseInfoError},
    model::{ImageTensor, InferenceEngine, InferenceError, InputShape, ModelHost},
    pipeline::Classifier,
    store::Store,
    AppState,
};

pub const SECRET: &str = "test-secret";
pub const BOUNDARY: &str = "XRAYBOUNDARY";
pub const SCORES: [f32; 7] = [0.1, 0.7, 0.05, 0.05, 0.05, 0.025, 0.025];

pub struct FixedEngine;

impl InferenceEngine for FixedEngine {
    fn input_shape(&self) -> InputShape {
        InputShape {
            height: 24,
            width: 24,
        }
    }

    fn output_len(&self) -> Option<usize> {
        Some(SCORES.len())
    }

    fn infer(&self, _input: &ImageTensor) -> Result<Vec<f32>, InferenceError> {
        Ok(SCORES.to_vec())
    }
}

pub struct CannedInfo;

#[async_trait]
impl DiseaseInfo for CannedInfo {
    async fn describe(&self, disease_name: &str) -> Result<String, DiseaseInfoError> {
        if disease_name == "Edema" {
            Ok("Fluid accumulation in the lungs.".to_string())
        } else {
            Err(DiseaseInfoError::EmptyResponse)
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Store,
}

pub async fn test_app(model_ready: bool) -> TestApp {
    let host = if model_ready {
        ModelHost::with_engine(FixedEngine).unwrap()
    } else {
        ModelHost::not_ready()
    };
    let store = Store::connect("sqlite::memory:").await.unwrap();

    let state = Arc::new(AppState {
        classifier: Classifier::new(Arc::new(host)),
        store: store.clone(),
        disease_info: Arc::new(CannedInfo),
        tokens: TokenKeys::new(SECRET),
    });

    TestApp {
        router: construct_router(state, 5 * 1024 * 1024),
        store,
    }
}

pub fn bearer(user_id: &str) -> String {
    let token = TokenKeys::new(SECRET)
        .issue(user_id, TokenType::Access)
        .unwrap();
    format!("Bearer {token}")
}

pub fn json_request(method: &str, uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// Registers `email` and logs in, returning the login response body.
pub async fn register_and_login(router: &Router, email: &str, password: &str) -> Value {
    let credentials = json!({ "email": email, "password": password });
    let (status, _) = send(
        router,
        json_request("POST", "/api/auth/register", None, credentials.clone()),
    )
    .await;
    assert_eq!(status, 201);

    let (status, body) = send(
        router,
        json_request("POST", "/api/auth/login", None, credentials),
    )
    .await;
    assert_eq!(status, 200);
    body
}

pub fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(64, 48, |x, y| Rgb([x as u8, y as u8, 200]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    buf
}

pub fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn predict_request(auth: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/predict")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn get_request(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> (u16, Value) {
    let response: Response<_> = router.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}
