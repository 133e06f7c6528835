//! TOML configuration and settings resolution
//!
//! Settings come from three places. A command-line flag wins over the
//! config file, which wins over the built-in default.

use crate::convert::ConvertArgs;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tflconv_core::{InputSpec, KeyRemap, Layer, LayerKind, Sequential, WeightBinding};

pub const DEFAULT_SOURCE: &str = "big-lama.pt";
pub const DEFAULT_OUTPUT: &str = "lama_model.tflite";
pub const DEFAULT_MODEL_NAME: &str = "lama";

/// Contents of a `--config` file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub source: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub state_dict_key: Option<String>,
    pub model_name: Option<String>,
    /// Written to `Model.description`
    pub description: Option<String>,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub weights: Vec<WeightBinding>,
    #[serde(default)]
    pub key_remap: Vec<RemapRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub shape: Option<Vec<usize>>,
    pub batch_size: Option<usize>,
}

/// One `[[layers]]` entry: a name plus the tagged layer kind
#[derive(Debug, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

/// One `[[key_remap]]` entry
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemapRule {
    pub pattern: String,
    pub replacement: String,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Fully resolved conversion settings
#[derive(Debug)]
pub struct Settings {
    pub source: PathBuf,
    pub output: PathBuf,
    pub state_dict_key: Option<String>,
    pub model_name: String,
    pub description: Option<String>,
    pub input: InputSpec,
    pub layers: Vec<LayerSpec>,
    pub weights: Vec<WeightBinding>,
    pub key_remap: Vec<KeyRemap>,
}

impl Settings {
    /// Merge command-line arguments over a config file
    pub fn resolve(args: &ConvertArgs, config: ConfigFile) -> Result<Self> {
        let mut input = InputSpec::default();
        if let Some(shape) = args.input_shape.clone().or(config.input.shape) {
            input.shape = shape;
        }
        if let Some(batch_size) = args.batch_size.or(config.input.batch_size) {
            input.batch_size = batch_size;
        }

        let key_remap = config
            .key_remap
            .iter()
            .map(|rule| {
                KeyRemap::new(&rule.pattern, rule.replacement.clone())
                    .with_context(|| format!("Invalid key_remap pattern {:?}", rule.pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        let model_name = config
            .model_name
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string());
        if model_name.is_empty() {
            bail!("model_name must not be empty");
        }

        Ok(Self {
            source: args
                .source
                .clone()
                .or(config.source)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE)),
            output: args
                .output
                .clone()
                .or(config.output)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            state_dict_key: args.state_dict_key.clone().or(config.state_dict_key),
            model_name,
            description: config.description,
            input,
            layers: config.layers,
            weights: config.weights,
            key_remap,
        })
    }

    /// Build the (still uninitialized) layer graph
    pub fn build_model(&self) -> Result<Sequential> {
        let mut model = Sequential::new(self.model_name.clone(), self.input.clone())
            .context("Invalid model input")?;
        for spec in &self.layers {
            model
                .add(Layer::new(spec.name.clone(), spec.kind.clone()))
                .with_context(|| format!("Invalid layer {:?}", spec.name))?;
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tflconv_core::{Activation, Padding, Param};

    const FULL_CONFIG: &str = r#"
source = "weights/big-lama.safetensors"
output = "out/lama.tflite"
model_name = "inpaint"

[input]
shape = [256, 256, 4]

[[key_remap]]
pattern = "^generator\\.model\\."
replacement = ""

[[layers]]
name = "stem"
type = "conv2d"
filters = 8
kernel_size = [3, 3]
padding = "same"
activation = "relu"

[[layers]]
name = "down"
type = "max_pool2d"
pool_size = [2, 2]

[[weights]]
source = "stem.weight"
layer = "stem"
param = "kernel"
"#;

    #[test]
    fn test_defaults_without_config() {
        let settings = Settings::resolve(&ConvertArgs::default(), ConfigFile::default()).unwrap();

        assert_eq!(settings.source, PathBuf::from("big-lama.pt"));
        assert_eq!(settings.output, PathBuf::from("lama_model.tflite"));
        assert_eq!(settings.model_name, "lama");
        assert_eq!(settings.input.full_shape(), vec![1, 512, 512, 4]);
        assert!(settings.layers.is_empty());
        assert!(settings.build_model().unwrap().layers().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = ConfigFile::parse(FULL_CONFIG).unwrap();
        assert_eq!(config.layers.len(), 2);
        assert_eq!(
            config.layers[0].kind,
            LayerKind::Conv2D {
                filters: 8,
                kernel_size: [3, 3],
                strides: [1, 1],
                padding: Padding::Same,
                dilation: [1, 1],
                use_bias: true,
                activation: Activation::Relu,
            }
        );
        assert_eq!(config.weights[0].param, Param::Kernel);

        let settings = Settings::resolve(&ConvertArgs::default(), config).unwrap();
        assert_eq!(settings.key_remap.len(), 1);

        let model = settings.build_model().unwrap();
        assert_eq!(model.name(), "inpaint");
        assert_eq!(model.output_shape().unwrap(), vec![1, 128, 128, 8]);
    }

    #[test]
    fn test_cli_overrides_config() {
        let config = ConfigFile::parse(FULL_CONFIG).unwrap();
        let args = ConvertArgs {
            output: Some(PathBuf::from("cli.tflite")),
            input_shape: Some(vec![64, 64, 4]),
            batch_size: Some(2),
            ..Default::default()
        };

        let settings = Settings::resolve(&args, config).unwrap();
        assert_eq!(settings.source, PathBuf::from("weights/big-lama.safetensors"));
        assert_eq!(settings.output, PathBuf::from("cli.tflite"));
        assert_eq!(settings.input.full_shape(), vec![2, 64, 64, 4]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = ConfigFile::parse("sourse = \"typo.pt\"\n");
        assert!(result.is_err());

        let result = ConfigFile::parse("[input]\nshape = [1, 2, 3]\nchannels = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_remap_pattern() {
        let config = ConfigFile::parse("[[key_remap]]\npattern = \"(\"\nreplacement = \"\"\n")
            .unwrap();
        let err = Settings::resolve(&ConvertArgs::default(), config).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid key_remap pattern"));
    }

    #[test]
    fn test_invalid_layer_reported() {
        let config = ConfigFile::parse(
            "[input]\nshape = [2, 2, 1]\n\n[[layers]]\nname = \"big\"\ntype = \"conv2d\"\nfilters = 1\nkernel_size = [5, 5]\n",
        )
        .unwrap();
        let settings = Settings::resolve(&ConvertArgs::default(), config).unwrap();
        assert!(settings.build_model().is_err());
    }
}
