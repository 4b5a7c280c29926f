//! Tests against a trained weights file
//!
//! Point `REPORT_WEIGHTS` at a safetensors file (and optionally `REPORT_VOCAB`
//! at its vocabulary) and run:
//!
//! cargo test --test real_model_tests --features real-weights -- --ignored --nocapture
//!
//! Each test returns early when the variables are not set.

#![cfg(feature = "real-weights")]

use std::io::Cursor;
use std::path::PathBuf;

use image::{ImageFormat, Rgb, RgbImage};
use report_decoder::{GenerationConfig, GenerationControl, InferenceContext, PreprocessConfig};

fn weights_path() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var("REPORT_WEIGHTS").ok()?);
    if path.exists() {
        Some(path)
    } else {
        println!("REPORT_WEIGHTS={} does not exist, skipping", path.display());
        None
    }
}

fn vocab_path() -> Option<PathBuf> {
    std::env::var("REPORT_VOCAB").ok().map(PathBuf::from)
}

fn chest_like_png() -> Vec<u8> {
    // Dark background with two lighter lobes
    let img = RgbImage::from_fn(256, 256, |x, y| {
        let lobe = (x as i32 - 80).pow(2) + (y as i32 - 128).pow(2) < 60 * 60
            || (x as i32 - 176).pow(2) + (y as i32 - 128).pow(2) < 60 * 60;
        let v = if lobe { 170 } else { 30 };
        Rgb([v, v, v])
    });
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

#[test]
#[ignore]
fn test_trained_weights_produce_report() {
    let Some(weights) = weights_path() else {
        println!("REPORT_WEIGHTS not set, skipping");
        return;
    };

    let context = InferenceContext::load(
        vocab_path().as_deref(),
        Some(weights.as_path()),
        true,
        0,
        GenerationConfig::default(),
        PreprocessConfig::default(),
    )
    .unwrap();
    assert!(context.weights_pretrained());

    let report = context
        .generate_from_bytes(&chest_like_png(), &GenerationControl::none())
        .unwrap();

    println!("Report ({} steps): {}", report.steps, report.text);
    assert!(!report.text.is_empty());
    assert!(report.tokens.len() <= context.generation_config().max_steps + 1);
}

#[test]
#[ignore]
fn test_trained_weights_cache_modes_agree() {
    let Some(weights) = weights_path() else {
        println!("REPORT_WEIGHTS not set, skipping");
        return;
    };

    let load = |use_kv_cache: bool| {
        InferenceContext::load(
            vocab_path().as_deref(),
            Some(weights.as_path()),
            true,
            0,
            GenerationConfig {
                max_steps: 30,
                use_kv_cache,
                ..Default::default()
            },
            PreprocessConfig::default(),
        )
        .unwrap()
    };

    let bytes = chest_like_png();
    let cached = load(true)
        .generate_from_bytes(&bytes, &GenerationControl::none())
        .unwrap();
    let naive = load(false)
        .generate_from_bytes(&bytes, &GenerationControl::none())
        .unwrap();

    assert_eq!(cached.tokens, naive.tokens);
}
