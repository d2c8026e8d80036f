/// Layer registry for rebuilding layers from serialized configs
///
/// The registry is an ordinary value owned by the caller: whoever loads layer
/// specs decides which classes are available by passing a registry in. A spec
/// is `{"class_name": "...", "config": {...}}`.
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::layers::{Layer, PositionEmbedding, RetrievalEmbedding, TiedOutputProjection, TrigPosEmbedding};
use crate::{EmbedSimError, Result};

/// Builds a layer from its `config` object
pub type LayerFactory = fn(serde_json::Value) -> Result<Box<dyn Layer>>;

/// Serialized form of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub class_name: String,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Serialize a layer to its spec
pub fn serialize_layer(layer: &dyn Layer) -> Result<serde_json::Value> {
    let spec = LayerSpec {
        class_name: layer.class_name().to_string(),
        config: layer.get_config()?,
    };
    Ok(serde_json::to_value(spec)?)
}

#[derive(Clone, Default)]
pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl LayerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that knows every layer in this crate
    pub fn with_builtin_layers() -> Self {
        let mut registry = Self::new();
        registry
            .register(RetrievalEmbedding::CLASS_NAME, |config| {
                Ok(Box::new(RetrievalEmbedding::from_config(config)?))
            })
            .register(TiedOutputProjection::CLASS_NAME, |config| {
                Ok(Box::new(TiedOutputProjection::from_config(config)?))
            })
            .register(PositionEmbedding::CLASS_NAME, |config| {
                Ok(Box::new(PositionEmbedding::from_config(config)?))
            })
            .register(TrigPosEmbedding::CLASS_NAME, |config| {
                Ok(Box::new(TrigPosEmbedding::from_config(config)?))
            });
        registry
    }

    /// Add a class; replaces any factory already registered under the name
    pub fn register(&mut self, class_name: impl Into<String>, factory: LayerFactory) -> &mut Self {
        let class_name = class_name.into();
        if self.factories.insert(class_name.clone(), factory).is_some() {
            log::warn!("Replacing layer factory for {}", class_name);
        } else {
            log::debug!("Registered layer class {}", class_name);
        }
        self
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Registered class names, sorted
    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Rebuild an unbuilt layer from its spec
    pub fn deserialize(&self, spec: &serde_json::Value) -> Result<Box<dyn Layer>> {
        let spec: LayerSpec = serde_json::from_value(spec.clone())?;
        self.instantiate(spec)
    }

    pub fn instantiate(&self, spec: LayerSpec) -> Result<Box<dyn Layer>> {
        let factory = self
            .factories
            .get(&spec.class_name)
            .ok_or_else(|| EmbedSimError::UnknownLayer(spec.class_name.clone()))?;
        factory(spec.config)
    }

    /// Rebuild every layer from a JSON array of specs
    pub fn load_from_reader<R: Read>(&self, reader: R) -> Result<Vec<Box<dyn Layer>>> {
        let specs: Vec<LayerSpec> = serde_json::from_reader(reader)?;
        specs.into_iter().map(|spec| self.instantiate(spec)).collect()
    }

    /// Load layers from a JSON file holding an array of specs
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Box<dyn Layer>>> {
        log::info!("Loading layer specs from: {:?}", path.as_ref());
        let file = File::open(path.as_ref())?;
        let layers = self.load_from_reader(BufReader::new(file))?;
        log::info!("Loaded {} layers", layers.len());
        Ok(layers)
    }
}

/// Write layer specs as a JSON array
pub fn save_layers<P: AsRef<Path>>(layers: &[&dyn Layer], path: P) -> Result<()> {
    let specs = layers
        .iter()
        .map(|layer| serialize_layer(*layer))
        .collect::<Result<Vec<_>>>()?;
    std::fs::write(path.as_ref(), serde_json::to_string_pretty(&specs)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        PositionEmbeddingConfig, PositionMode, RetrievalEmbeddingConfig, TiedOutputProjectionConfig,
        TrigPosEmbeddingConfig,
    };

    #[test]
    fn test_builtin_classes() {
        let registry = LayerRegistry::with_builtin_layers();
        assert_eq!(
            registry.class_names(),
            vec!["PositionEmbedding", "RetrievalEmbedding", "TiedOutputProjection", "TrigPosEmbedding"]
        );
        assert!(LayerRegistry::new().class_names().is_empty());
    }

    #[test]
    fn test_roundtrip_all_builtin_layers() -> Result<()> {
        let registry = LayerRegistry::with_builtin_layers();
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(20, 8).with_pad_id(0))?),
            Box::new(TiedOutputProjection::new(TiedOutputProjectionConfig {
                stop_gradient: true,
                ..Default::default()
            })?),
            Box::new(PositionEmbedding::new(PositionEmbeddingConfig::new(16, 8, PositionMode::Add))?),
            Box::new(TrigPosEmbedding::new(TrigPosEmbeddingConfig::new(PositionMode::Concat, Some(4)))?),
        ];

        for layer in &layers {
            let spec = serialize_layer(layer.as_ref())?;
            let restored = registry.deserialize(&spec)?;
            assert_eq!(restored.class_name(), layer.class_name());
            assert_eq!(restored.name(), layer.name());
            assert_eq!(restored.get_config()?, layer.get_config()?);
            assert!(!restored.is_built());
        }

        Ok(())
    }

    #[test]
    fn test_unknown_class_rejected() {
        let registry = LayerRegistry::with_builtin_layers();
        let spec = serde_json::json!({"class_name": "Dense", "config": {}});
        assert!(matches!(registry.deserialize(&spec), Err(EmbedSimError::UnknownLayer(_))));
    }

    #[test]
    fn test_scoped_registry_only_knows_what_was_registered() -> Result<()> {
        let mut registry = LayerRegistry::new();
        registry.register(TiedOutputProjection::CLASS_NAME, |config| {
            Ok(Box::new(TiedOutputProjection::from_config(config)?))
        });

        let head = serde_json::json!({"class_name": "TiedOutputProjection"});
        assert!(registry.deserialize(&head)?.supports_masking());

        let embed = serde_json::json!({"class_name": "RetrievalEmbedding", "config": {"input_dim": 3, "output_dim": 2}});
        assert!(registry.deserialize(&embed).is_err());
        Ok(())
    }

    #[test]
    fn test_unknown_config_key_rejected() {
        let registry = LayerRegistry::with_builtin_layers();
        let spec = serde_json::json!({
            "class_name": "TiedOutputProjection",
            "config": {"use_bias": true, "activation": "relu"}
        });
        assert!(matches!(registry.deserialize(&spec), Err(EmbedSimError::Config(_))));
    }

    #[test]
    fn test_load_from_reader() -> Result<()> {
        let registry = LayerRegistry::with_builtin_layers();
        let json = r#"[
            {"class_name": "RetrievalEmbedding", "config": {"name": "tokens", "input_dim": 50, "output_dim": 8, "pad_id": 0}},
            {"class_name": "TiedOutputProjection", "config": {"name": "head", "use_bias": false}}
        ]"#;

        let layers = registry.load_from_reader(json.as_bytes())?;
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].name(), "tokens");
        assert_eq!(layers[1].name(), "head");
        assert_eq!(layers[1].get_config()?["use_bias"], false);
        Ok(())
    }

    #[test]
    fn test_save_and_load_layers() -> Result<()> {
        let registry = LayerRegistry::with_builtin_layers();
        let embed = RetrievalEmbedding::new(RetrievalEmbeddingConfig::new(10, 4))?;
        let head = TiedOutputProjection::new(TiedOutputProjectionConfig::default())?;

        let path = std::env::temp_dir().join(format!("embed_sim_layers_{}.json", std::process::id()));
        let layers: [&dyn Layer; 2] = [&embed, &head];
        save_layers(&layers, &path)?;
        let loaded = registry.load(&path);
        std::fs::remove_file(&path).ok();

        let loaded = loaded?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].class_name(), "RetrievalEmbedding");
        assert_eq!(loaded[1].class_name(), "TiedOutputProjection");
        Ok(())
    }
}
