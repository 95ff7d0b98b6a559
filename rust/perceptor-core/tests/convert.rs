//! End-to-end checkpoint conversion through the filesystem.
//!
//! Run with: cargo test --package perceptor-core --test convert

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use perceptor_core::{
    convert_checkpoint, ConfigFile, ConvertOptions, FeatureExtractorConfig, ViTMAEConfig,
};

fn tiny_config() -> ViTMAEConfig {
    ViTMAEConfig {
        hidden_size: 8,
        num_hidden_layers: 1,
        num_attention_heads: 2,
        intermediate_size: 16,
        image_size: 32,
        patch_size: 16,
        decoder_hidden_size: 4,
        decoder_num_attention_heads: 2,
        decoder_num_hidden_layers: 1,
        decoder_intermediate_size: 8,
        ..Default::default()
    }
}

/// A checkpoint laid out like the reference MAE release.
fn reference_checkpoint() -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let zeros = |shape: &[usize]| Tensor::zeros(shape, DType::F32, &dev).unwrap();
    let mut state = HashMap::new();
    state.insert("cls_token".to_string(), zeros(&[1, 1, 8]));
    state.insert("pos_embed".to_string(), zeros(&[1, 5, 8]));
    state.insert("patch_embed.proj.weight".to_string(), zeros(&[8, 3, 16, 16]));
    state.insert("patch_embed.proj.bias".to_string(), zeros(&[8]));
    state.insert(
        "blocks.0.attn.qkv.weight".to_string(),
        Tensor::arange(0f32, 192., &dev).unwrap().reshape((24, 8)).unwrap(),
    );
    state.insert("blocks.0.attn.qkv.bias".to_string(), zeros(&[24]));
    state.insert("blocks.0.attn.proj.weight".to_string(), zeros(&[8, 8]));
    state.insert("blocks.0.norm1.weight".to_string(), zeros(&[8]));
    state.insert("blocks.0.norm2.weight".to_string(), zeros(&[8]));
    state.insert("blocks.0.mlp.fc1.weight".to_string(), zeros(&[16, 8]));
    state.insert("blocks.0.mlp.fc2.weight".to_string(), zeros(&[8, 16]));
    state.insert("norm.weight".to_string(), zeros(&[8]));
    state.insert("norm.bias".to_string(), zeros(&[8]));
    state.insert("mask_token".to_string(), zeros(&[1, 1, 4]));
    state.insert("decoder_embed.weight".to_string(), zeros(&[4, 8]));
    state.insert("decoder_pos_embed".to_string(), zeros(&[1, 5, 4]));
    state.insert("decoder_blocks.0.attn.qkv.weight".to_string(), zeros(&[12, 4]));
    state.insert("decoder_norm.weight".to_string(), zeros(&[4]));
    state.insert("decoder_pred.weight".to_string(), zeros(&[768, 4]));
    state
}

#[test]
fn test_convert_reference_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("mae_pretrain.safetensors");
    candle_core::safetensors::save(&reference_checkpoint(), &input).unwrap();

    let output = dir.path().join("converted");
    let config = tiny_config();
    let report = convert_checkpoint(&input, &output, &config, &ConvertOptions::default()).unwrap();

    assert_eq!(report.tensors_read, 19);
    assert_eq!(report.split, 3);
    assert!(report.unchanged.is_empty(), "unchanged: {:?}", report.unchanged);
    // three fused tensors become nine
    assert_eq!(report.tensors_written, 19 - 3 + 9);

    let weights = candle_core::safetensors::load(output.join("model.safetensors"), &Device::Cpu).unwrap();
    assert_eq!(weights.len(), report.tensors_written);
    for key in [
        "vit.embeddings.cls_token",
        "vit.embeddings.position_embeddings",
        "vit.embeddings.patch_embeddings.projection.weight",
        "vit.encoder.layer.0.attention.attention.query.weight",
        "vit.encoder.layer.0.attention.attention.value.bias",
        "vit.encoder.layer.0.attention.output.dense.weight",
        "vit.encoder.layer.0.layernorm_before.weight",
        "vit.encoder.layer.0.intermediate.dense.weight",
        "vit.layernorm.bias",
        "decoder.mask_token",
        "decoder.decoder_embed.weight",
        "decoder.decoder_pos_embed",
        "decoder.decoder_layers.0.attention.attention.key.weight",
        "decoder.decoder_norm.weight",
        "decoder.decoder_pred.weight",
    ] {
        assert!(weights.contains_key(key), "missing {key}");
    }

    let value = weights["vit.encoder.layer.0.attention.attention.value.weight"]
        .to_vec2::<f32>()
        .unwrap();
    assert_eq!(value.len(), 8);
    assert_eq!(value[0][0], 128.0);

    let saved = ViTMAEConfig::from_json(output.join("config.json")).unwrap();
    assert_eq!(saved, config);
    let extractor = FeatureExtractorConfig::from_json(output.join("preprocessor_config.json")).unwrap();
    assert_eq!(extractor.size, 32);
}

#[test]
fn test_convert_missing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let result = convert_checkpoint(
        &dir.path().join("missing.pth"),
        &dir.path().join("out"),
        &tiny_config(),
        &ConvertOptions::default(),
    );
    assert!(result.is_err());
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_convert_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ckpt.safetensors");
    candle_core::safetensors::save(&reference_checkpoint(), &input).unwrap();
    let config = ViTMAEConfig {
        num_attention_heads: 3,
        ..tiny_config()
    };
    let result = convert_checkpoint(&input, &dir.path().join("out"), &config, &ConvertOptions::default());
    assert!(result.is_err());
}
