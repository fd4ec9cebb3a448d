use pneumo_shared::{format_percent, Label, PredictionResponse};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tch::nn::{FuncT, ModuleT, VarStore};
use tch::vision::resnet;
use tch::{CModule, Device, Kind, TchError, Tensor};

use crate::config::{DeviceKind, ModelConfig, ModelFormat};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model file not found at: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("Model weights could not be applied: {0}")]
    ArtifactCorrupt(String),
    #[error("Requested device is not available: {0}")]
    DeviceUnavailable(String),
}

impl LoadError {
    /// Short machine-readable reason, safe to expose on the health endpoint.
    pub fn reason(&self) -> &'static str {
        match self {
            LoadError::ArtifactMissing(_) => "artifact_missing",
            LoadError::ArtifactCorrupt(_) => "artifact_corrupt",
            LoadError::DeviceUnavailable(_) => "device_unavailable",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Preprocessing error: {0}")]
    Preprocess(String),
    #[error("Model error: {0}")]
    Model(#[from] TchError),
    #[error("Unexpected model output shape: {0:?}")]
    UnexpectedOutput(Vec<i64>),
    #[error("Inference worker failed: {0}")]
    Worker(String),
}

/// A network producing one row of class logits per input image.
pub trait Classifier: Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError>;
    fn device(&self) -> Device;
}

struct ResNetClassifier {
    net: Mutex<FuncT<'static>>,
    // Owns the variables the closure reads from.
    _vs: VarStore,
    device: Device,
}

impl Classifier for ResNetClassifier {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        let net = self
            .net
            .lock()
            .map_err(|_| TchError::Torch("classifier lock poisoned".into()))?;
        Ok(tch::no_grad(|| net.forward_t(input, false)))
    }

    fn device(&self) -> Device {
        self.device
    }
}

struct ScriptClassifier {
    module: Mutex<CModule>,
    device: Device,
}

impl Classifier for ScriptClassifier {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        let module = self
            .module
            .lock()
            .map_err(|_| TchError::Torch("classifier lock poisoned".into()))?;
        tch::no_grad(|| module.forward_ts(&[input]))
    }

    fn device(&self) -> Device {
        self.device
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub confidence: f32,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Arg-max over a distribution indexed like [`Label`]. Ties go to the
    /// lower index.
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self, InferenceError> {
        if probabilities.len() != Label::count() {
            return Err(InferenceError::UnexpectedOutput(vec![
                probabilities.len() as i64,
            ]));
        }

        let mut best = 0;
        for (index, probability) in probabilities.iter().enumerate() {
            if *probability > probabilities[best] {
                best = index;
            }
        }
        let label = Label::from_index(best)
            .ok_or_else(|| InferenceError::UnexpectedOutput(vec![best as i64]))?;

        Ok(Self {
            label,
            confidence: probabilities[best],
            probabilities,
        })
    }

    pub fn to_response(&self) -> PredictionResponse {
        let probabilities = self
            .probabilities
            .iter()
            .enumerate()
            .filter_map(|(index, p)| Label::from_index(index).map(|label| (label, format_percent(*p))))
            .collect();

        PredictionResponse {
            result: self.label,
            confidence: format_percent(self.confidence),
            probabilities,
        }
    }
}

pub struct Model {
    classifier: Box<dyn Classifier>,
}

impl Model {
    pub fn load(config: &ModelConfig) -> Result<Self, LoadError> {
        let path = resolve_artifact_path(&config.path);
        let device = select_device(config.device)?;
        log::info!("Loading model from: {} on device: {:?}", path.display(), device);

        if !path.exists() {
            log::error!("Model file not found at: {}", path.display());
            return Err(LoadError::ArtifactMissing(path));
        }

        let classifier: Box<dyn Classifier> = match config.format {
            ModelFormat::Weights => Box::new(load_resnet(&path, device)?),
            ModelFormat::Torchscript => Box::new(load_torchscript(&path, device)?),
        };

        log::info!("Model loaded successfully.");
        Ok(Self { classifier })
    }

    pub fn from_classifier<C: Classifier + 'static>(classifier: C) -> Self {
        Self {
            classifier: Box::new(classifier),
        }
    }

    pub fn device(&self) -> Device {
        self.classifier.device()
    }

    /// One forward pass over a preprocessed `[1, 3, H, W]` batch.
    pub fn infer(&self, input: &Tensor) -> Result<Prediction, InferenceError> {
        let logits = self.classifier.forward(input)?;
        let shape = logits.size();
        if shape != [1, Label::count() as i64] {
            return Err(InferenceError::UnexpectedOutput(shape));
        }

        let probabilities = logits
            .f_softmax(-1, Kind::Float)?
            .f_view([-1])?
            .to_device(Device::Cpu);
        let probabilities: Vec<f32> = Vec::<f32>::try_from(&probabilities)?;
        Prediction::from_probabilities(probabilities)
    }
}

/// Availability of the classifier, decided once at startup.
pub enum ModelState {
    Available(Arc<Model>),
    Unavailable(LoadError),
}

impl ModelState {
    pub fn from_load(result: Result<Model, LoadError>) -> Self {
        match result {
            Ok(model) => ModelState::Available(Arc::new(model)),
            Err(e) => ModelState::Unavailable(e),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, ModelState::Available(_))
    }
}

fn resolve_artifact_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(e) => {
            log::warn!("Could not locate the running executable: {}", e);
            path.to_path_buf()
        }
    }
}

fn select_device(kind: DeviceKind) -> Result<Device, LoadError> {
    match kind {
        DeviceKind::Auto => Ok(Device::cuda_if_available()),
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda if tch::Cuda::is_available() => Ok(Device::Cuda(0)),
        DeviceKind::Cuda => Err(LoadError::DeviceUnavailable("cuda".into())),
    }
}

fn corrupt(e: TchError) -> LoadError {
    log::error!("Error loading model: {:?}", e);
    LoadError::ArtifactCorrupt(e.to_string())
}

fn load_resnet(path: &Path, device: Device) -> Result<ResNetClassifier, LoadError> {
    let mut vs = VarStore::new(device);
    let net = resnet::resnet18(&vs.root(), Label::count() as i64);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("pt") | Some("pth") => copy_state_dict(&vs, path)?,
        _ => vs.load(path).map_err(corrupt)?,
    }
    vs.freeze();

    Ok(ResNetClassifier {
        net: Mutex::new(net),
        _vs: vs,
        device,
    })
}

/// Copies a `torch.save(state_dict)` archive into the var store. Keys the
/// architecture does not declare (e.g. `num_batches_tracked`) are skipped.
fn copy_state_dict(vs: &VarStore, path: &Path) -> Result<(), LoadError> {
    let loaded: HashMap<String, Tensor> = Tensor::loadz_multi_with_device(path, vs.device())
        .map_err(corrupt)?
        .into_iter()
        .collect();

    let mut variables = vs.variables();
    tch::no_grad(|| {
        for (name, variable) in variables.iter_mut() {
            let source = loaded
                .get(name)
                .ok_or_else(|| LoadError::ArtifactCorrupt(format!("missing tensor '{}'", name)))?;
            if source.size() != variable.size() {
                return Err(LoadError::ArtifactCorrupt(format!(
                    "shape mismatch for '{}': expected {:?}, found {:?}",
                    name,
                    variable.size(),
                    source.size()
                )));
            }
            variable.f_copy_(source).map_err(corrupt)?;
        }
        Ok(())
    })
}

fn load_torchscript(path: &Path, device: Device) -> Result<ScriptClassifier, LoadError> {
    let mut module = CModule::load_on_device(path, device).map_err(corrupt)?;
    module.set_eval();
    Ok(ScriptClassifier {
        module: Mutex::new(module),
        device,
    })
}
