/// Tied-embedding decoder head - builds the layers, runs a forward pass and
/// writes the layer specs out so they can be reloaded through a registry
use candle_core::{Device, Tensor, D};
use candle_nn::VarMap;
use embed_sim::config::{
    BaseLayerConfig, PositionEmbeddingConfig, PositionMode, RetrievalEmbeddingConfig, TiedOutputProjectionConfig,
};
use embed_sim::layers::{BuildContext, Layer};
use embed_sim::registry::save_layers;
use embed_sim::{LayerRegistry, PositionEmbedding, RetrievalEmbedding, TiedOutputProjection};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== Tied embedding decoder head ===");

    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let vocab_size = 32;
    let hidden_size = 16;
    let seq_len = 8;

    let varmap = VarMap::new();
    let ctx = BuildContext::new(&varmap, &device);

    let mut embed = RetrievalEmbedding::new(RetrievalEmbeddingConfig {
        base: BaseLayerConfig::named("token_embedding"),
        ..RetrievalEmbeddingConfig::new(vocab_size, hidden_size).with_pad_id(0)
    })?;
    let mut position = PositionEmbedding::new(PositionEmbeddingConfig {
        base: BaseLayerConfig::named("position_embedding"),
        ..PositionEmbeddingConfig::new(seq_len, hidden_size, PositionMode::Add)
    })?;
    let mut head = TiedOutputProjection::new(TiedOutputProjectionConfig {
        base: BaseLayerConfig::named("decoder_head"),
        ..Default::default()
    })?;

    // Token ids with trailing padding
    let ids = Tensor::new(&[[4u32, 9, 17, 2, 0, 0, 0, 0], [11, 3, 3, 8, 21, 6, 1, 0]], &device)?;

    let embedded = embed.apply(&[ids.clone()], None, &ctx)?;
    let masks = embed.compute_mask(&[ids], None)?;
    let hidden = position.apply(&embedded[..1], Some(&masks[..1]), &ctx)?;
    let probs = head.apply(&[hidden[0].clone(), embedded[1].clone()], None, &ctx)?;

    log::info!("Output shape: {:?}", probs[0].dims());
    let predictions = probs[0].argmax(D::Minus1)?.to_vec2::<u32>()?;
    log::info!("Greedy predictions: {:?}", predictions);

    let layers: [&dyn Layer; 3] = [&embed, &position, &head];
    for layer in layers {
        log::info!(
            "  - {} ({}): {} parameters",
            layer.name(),
            layer.class_name(),
            embed_sim::utils::count_layer_parameters(layer)
        );
    }

    let specs_path = std::env::temp_dir().join("tied_decoder_layers.json");
    save_layers(&layers, &specs_path)?;
    log::info!("Layer specs written to {:?}", specs_path);

    let registry = LayerRegistry::with_builtin_layers();
    let reloaded = registry.load(&specs_path)?;
    for layer in &reloaded {
        log::info!("Reloaded {} as {}", layer.name(), layer.class_name());
    }

    Ok(())
}
