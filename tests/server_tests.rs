//! HTTP tests for the report server
//!
//! Each test binds an ephemeral port, serves a tiny randomly initialized
//! model and talks to it with reqwest.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::{multipart, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use report_decoder::server::{serve, AppState};
use report_decoder::{
    GenerationConfig, InferenceContext, ModelConfig, PreprocessConfig, Tokenizer, Weights,
};

fn tiny_context() -> InferenceContext {
    let tokenizer = Tokenizer::from_words(["normal", "lung", "field", "clear"]).unwrap();
    let config = ModelConfig::tiny(tokenizer.vocab_size());
    let weights = Weights::random(&config, 5).unwrap();
    InferenceContext::from_weights(
        tokenizer,
        &weights,
        &config,
        GenerationConfig {
            beam_width: 2,
            max_steps: 12,
            ..Default::default()
        },
        PreprocessConfig {
            input_size: 8,
            ..Default::default()
        },
    )
    .unwrap()
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(Arc::new(tiny_context()));
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });
    addr
}

fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(20, 20, |x, y| Rgb([(x * 12) as u8, (y * 12) as u8, 90]));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

async fn error_message(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_and_model_info() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["device"], "cpu");

    let response = client
        .get(format!("http://{addr}/model-info"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["vocab_size"], 8);
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["weights_loaded"], false);
    assert_eq!(body["beam_width"], 2);
    assert_eq!(body["max_steps"], 12);
}

#[tokio::test]
async fn test_generate_from_multipart_upload() {
    let addr = spawn_server().await;
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(png_bytes())
            .file_name("chest.png")
            .mime_str("image/png")
            .unwrap(),
    );

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/generate-report"))
        .multipart(form)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert!(body["report"].is_string());
}

#[tokio::test]
async fn test_generate_from_base64_json() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let encoded = STANDARD.encode(png_bytes());

    // Plain base64 and a data URL carrying the same image give the same report
    let mut reports = Vec::new();
    for image_data in [encoded.clone(), format!("data:image/png;base64,{encoded}")] {
        let response = client
            .post(format!("http://{addr}/generate-report"))
            .json(&json!({ "image_data": image_data }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], "success");
        reports.push(body["report"].as_str().unwrap().to_string());
    }
    assert_eq!(reports[0], reports[1]);
}

#[tokio::test]
async fn test_missing_image_is_bad_request() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/generate-report");

    let response = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_message(response).await, "No image provided");

    let response = client
        .post(&url)
        .json(&json!({ "image_data": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_message(response).await, "No image provided");

    // Multipart form without an `image` field
    let form = multipart::Form::new().text("note", "no file here");
    let response = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_message(response).await, "No image provided");
}

#[tokio::test]
async fn test_malformed_payloads_are_bad_request() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/generate-report");

    // Not base64
    let response = client
        .post(&url)
        .json(&json!({ "image_data": "%%% not base64 %%%" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Valid base64, not an image
    let response = client
        .post(&url)
        .json(&json!({ "image_data": STANDARD.encode(b"definitely not a png") }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(error_message(response).await.starts_with("Image error"));

    // Body that is not JSON at all
    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(error_message(response)
        .await
        .starts_with("Invalid request body"));

    // The server keeps serving after rejected requests
    let response = client
        .post(&url)
        .json(&json!({ "image_data": STANDARD.encode(png_bytes()) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_empty_file_selection_is_bad_request() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/generate-report");

    // Form submitted with no file chosen
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(vec![1, 2, 3]).file_name(""),
    );
    let response = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_message(response).await, "No file selected");

    // Named file with no content
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(Vec::new()).file_name("chest.png"),
    );
    let response = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        error_message(response).await,
        "Invalid input: Empty image payload"
    );

    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(png_bytes()).file_name("chest.png"),
    );
    let response = client.post(&url).multipart(form).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
}
