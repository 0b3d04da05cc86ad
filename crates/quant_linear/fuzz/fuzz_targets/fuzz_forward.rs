#![no_main]
use candle_core::{Device, Tensor};
use libfuzzer_sys::fuzz_target;
use quant_linear::{
    ForwardOptions, ModelConfig, QuantLinear, ScratchPool, TernaryKernel, WeightSource,
};
use std::collections::HashMap;
use std::sync::Arc;

const OUT_FEATURES: usize = 32;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    // 1. Parse Parameters
    let in_q = 1 + (data[0] as usize % 8); // in_features 4..=32
    let in_features = in_q * 4;
    let num_bases = 1 + (data[1] as usize % 3);
    let rows = 1 + (data[2] as usize % 40); // crosses the reconstruction threshold
    let rest = &data[3..];

    // 2. Packed codes (any byte, including the unused 0b11 code) and scales
    let packed_len = OUT_FEATURES * in_q * num_bases;
    if rest.len() < packed_len + num_bases {
        return;
    }
    let (packed, rest) = rest.split_at(packed_len);
    let (scale_bytes, act_bytes) = rest.split_at(num_bases);
    let scales: Vec<f32> = scale_bytes.iter().map(|b| *b as f32 / 64.0).collect();

    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "weight_packed".to_string(),
        Tensor::from_vec(packed.to_vec(), (OUT_FEATURES, in_q, num_bases), &device).unwrap(),
    );
    tensors.insert(
        "scales".to_string(),
        Tensor::from_vec(scales, (num_bases,), &device).unwrap(),
    );

    // 3. Load
    let config = ModelConfig::new(64, 1, 0);
    let mut layer: QuantLinear = QuantLinear::new(
        "fuzz",
        in_features,
        OUT_FEATURES,
        false,
        &config,
        &device,
        Arc::new(TernaryKernel::new()),
    );
    let pool = ScratchPool::new();
    pool.reserve(0, layer.scratch_space()).unwrap();
    if layer.load(WeightSource::Quantized(tensors), &pool).is_err() {
        return;
    }

    // 4. Activations: wrap around the remaining bytes
    let act: Vec<f32> = (0..rows * in_features)
        .map(|i| match act_bytes.get(i % act_bytes.len().max(1)) {
            Some(b) => (*b as f32 - 128.0) / 32.0,
            None => 0.0,
        })
        .collect();
    let x = Tensor::from_vec(act, (rows, in_features), &device).unwrap();

    // 5. Every dispatch path must agree on shape and not panic
    for opts in [
        ForwardOptions::default(),
        ForwardOptions::new().alt_kernel(),
        ForwardOptions::new().reconstruct(),
    ] {
        let y = layer.forward(&x, &opts).unwrap().into_tensor();
        assert_eq!(y.dims(), &[rows, OUT_FEATURES]);
    }

    layer.unload();
});
