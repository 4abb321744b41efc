//! End-to-end translation scenarios through the public API
//!
//! Models are written to temporary directories in each supported layout
//! and loaded back with `Translator::from_dir`.

use std::path::Path;

use traducir::config::{JSON_FILE, PROPERTIES_FILE};
use traducir::store::SAFETENSORS_FILE;
use traducir::testing::{tiny_settings, SyntheticModel, WeightInit};
use traducir::trace::{InferenceTracer, TraceConfig, TraceStep};
use traducir::{
    GenerationConfig, ModelSettings, SamplerKind, StopReason, TraducirError, TranslationState,
    Translator,
};

fn random_model(seed: u64) -> SyntheticModel {
    SyntheticModel::new(tiny_settings(), WeightInit::Random { seed })
}

/// Write every tensor of `model` into one F32 safetensors container
fn write_safetensors(model: &SyntheticModel, path: &Path) {
    let settings = model.settings();
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();

    for (name, values) in model.store().iter() {
        let matrix = name.ends_with("wte") || name.ends_with("wpe") || {
            name.ends_with(".w") && !name.contains("norm")
        };
        let shape = if matrix {
            let cols = if name.ends_with("mlp.layer1.w") {
                settings.feed_forward_size()
            } else {
                settings.hidden_size
            };
            vec![values.len() / cols, cols]
        } else {
            vec![values.len()]
        };

        let start = data.len();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": "F32",
                "shape": shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }

    let json = serde_json::to_string(&header).expect("header");
    let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(json.as_bytes());
    bytes.extend_from_slice(&data);
    std::fs::write(path, bytes).expect("write container");
}

// ============================================================================
// Model directory layouts
// ============================================================================

#[test]
fn test_properties_directory_round_trip() {
    let model = random_model(21);
    let dir = tempfile::tempdir().expect("tempdir");
    model.write_to_dir(dir.path()).expect("write");

    let translator = Translator::from_dir(dir.path()).expect("load");
    assert_eq!(translator.settings(), model.settings());
    assert_eq!(
        translator.translate(&[3, 5]).expect("translate"),
        model.build().expect("build").translate(&[3, 5]).expect("translate")
    );
}

#[test]
fn test_json_settings_directory() {
    let model = random_model(4);
    let dir = tempfile::tempdir().expect("tempdir");
    model.write_to_dir(dir.path()).expect("write");
    std::fs::remove_file(dir.path().join(PROPERTIES_FILE)).expect("remove properties");
    std::fs::write(
        dir.path().join(JSON_FILE),
        serde_json::to_string_pretty(model.settings()).expect("json"),
    )
    .expect("write json");

    let settings = ModelSettings::from_dir(dir.path()).expect("settings");
    assert_eq!(&settings, model.settings());
    assert!(Translator::from_dir(dir.path()).is_ok());
}

#[test]
fn test_safetensors_directory_matches_raw_files() {
    let model = random_model(8);
    let raw = tempfile::tempdir().expect("tempdir");
    model.write_to_dir(raw.path()).expect("write");

    let packed = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        packed.path().join(PROPERTIES_FILE),
        model.settings().to_properties(),
    )
    .expect("write properties");
    write_safetensors(&model, &packed.path().join(SAFETENSORS_FILE));

    let from_raw = Translator::from_dir(raw.path()).expect("raw");
    let from_packed = Translator::from_dir(packed.path()).expect("packed");
    for input in [&[3u32][..], &[4, 6, 7], &[]] {
        assert_eq!(
            from_raw.translate(input).expect("translate"),
            from_packed.translate(input).expect("translate")
        );
    }
}

#[test]
fn test_truncated_tensor_file_rejected() {
    let model = SyntheticModel::tiny();
    let dir = tempfile::tempdir().expect("tempdir");
    model.write_to_dir(dir.path()).expect("write");
    std::fs::write(dir.path().join("encoders/input/wte"), [0u8; 12]).expect("truncate");

    let err = Translator::from_dir(dir.path()).unwrap_err();
    assert!(
        matches!(err, TraducirError::TensorShapeMismatch { ref name, .. } if name == "encoders/input/wte"),
        "unexpected error: {err}"
    );
    assert!(err.is_construction_error());
}

#[test]
fn test_missing_settings_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = Translator::from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, TraducirError::IoError { .. }), "unexpected error: {err}");
}

#[test]
fn test_missing_setting_key_named() {
    let dir = tempfile::tempdir().expect("tempdir");
    let properties: String = tiny_settings()
        .to_properties()
        .lines()
        .filter(|line| !line.starts_with("hidden.size"))
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(dir.path().join(PROPERTIES_FILE), properties).expect("write");

    let err = ModelSettings::from_dir(dir.path()).unwrap_err();
    assert_eq!(
        err,
        TraducirError::MissingSetting {
            key: "hidden.size".to_string()
        }
    );
}

// ============================================================================
// Generation
// ============================================================================

#[test]
fn test_forced_model_full_length() {
    let translator = SyntheticModel::tiny()
        .force_output_token(5)
        .expect("force")
        .build()
        .expect("model");

    let translation = translator.translate(&[]).expect("translate");
    assert_eq!(translation.tokens, vec![5; 5]);
    assert_eq!(translation.stop_reason, StopReason::MaxLength);
    assert_eq!(translation.display_tokens(), &[5; 4]);
}

#[test]
fn test_max_positions_beyond_context_is_capped() {
    let translator = SyntheticModel::tiny()
        .force_output_token(5)
        .expect("force")
        .build()
        .expect("model");
    let config = GenerationConfig::greedy().with_max_positions(50);

    assert_eq!(translator.translate_with(&[3], &config).expect("translate").steps, 5);
}

#[test]
fn test_weighted_random_stays_in_vocabulary() {
    let translator = SyntheticModel::tiny()
        .force_output_token(2)
        .expect("force")
        .build()
        .expect("model");

    for seed in 0..8 {
        let config =
            GenerationConfig::greedy().with_sampler(SamplerKind::WeightedRandom { seed });
        let translation = translator.translate_with(&[4], &config).expect("translate");
        assert!(!translation.tokens.is_empty());
        assert!(translation.tokens.iter().all(|&t| t < 8));
    }
}

#[test]
fn test_biasless_model_translates() {
    let mut settings = tiny_settings();
    settings.bias = traducir::BiasFlags::all(false);
    let translator = SyntheticModel::new(settings, WeightInit::Random { seed: 9 })
        .build()
        .expect("model");

    let translation = translator.translate(&[3, 4]).expect("translate");
    assert!(translation.steps >= 1);
}

#[test]
fn test_deeper_model_translates() {
    let mut settings = tiny_settings();
    settings.encoder_count = 3;
    settings.decoder_count = 2;
    settings.hidden_size = 8;
    settings.encoder_head_count = 4;
    settings.decoder_head_count = 2;
    settings.encoder_score_dividend = 2;
    settings.context_size = 7;
    let translator = SyntheticModel::new(settings, WeightInit::Random { seed: 30 })
        .build()
        .expect("model");

    let translation = translator.translate(&[3, 4, 5, 6]).expect("translate");
    assert!(translation.steps <= 7);
    assert!(translation.tokens.iter().all(|&t| t < 8));
}

// ============================================================================
// Sessions and tracing
// ============================================================================

#[test]
fn test_session_recovers_after_failure() {
    let translator = random_model(12).build().expect("model");
    let mut session = translator.new_session().expect("session");
    let config = GenerationConfig::greedy();

    assert!(translator
        .translate_with_session(&mut session, &[1, 2, 3, 4, 5, 6], &config)
        .is_err());
    assert_eq!(session.state(), TranslationState::Idle);

    let after = translator
        .translate_with_session(&mut session, &[3], &config)
        .expect("translate");
    assert_eq!(after, translator.translate(&[3]).expect("translate"));
}

#[test]
fn test_trace_json_covers_pipeline() {
    let translator = random_model(3).build().expect("model");
    let mut tracer = InferenceTracer::new(TraceConfig::enabled());
    tracer.set_model_info(translator.model_info("tiny"));
    let mut session = translator.new_session().expect("session").with_tracer(tracer);

    translator
        .translate_with_session(&mut session, &[3, 4], &GenerationConfig::greedy())
        .expect("translate");

    let json: serde_json::Value =
        serde_json::from_str(&session.tracer().to_json()).expect("trace json");
    assert_eq!(json["model"]["name"], "tiny");
    assert_eq!(json["model"]["vocab_size"], 8);

    let events = json["events"].as_array().expect("events");
    for step in [TraceStep::Encode, TraceStep::CrossPrime, TraceStep::Clear] {
        assert!(
            events.iter().any(|e| e["step"] == step.name()),
            "missing {}",
            step.name()
        );
    }
}
