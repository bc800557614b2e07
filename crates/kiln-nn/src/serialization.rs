//! Model persistence: safetensors weights and a JSON inference-graph manifest.

use std::collections::HashMap;
use std::path::Path;

use kiln_core::autograd::NoGradGuard;
use kiln_core::{KilnError, Result, Tensor};
use safetensors::tensor::{serialize, TensorView};
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::module::Module;

/// Save a state dictionary (name → Tensor) to a safetensors file.
pub fn save_state_dict(state_dict: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let buffers: Vec<(&String, &Tensor, Vec<u8>)> = state_dict
        .iter()
        .map(|(name, t)| (name, t, t.as_slice().iter().flat_map(|f| f.to_le_bytes()).collect()))
        .collect();

    let views = buffers
        .iter()
        .map(|(name, t, bytes)| {
            TensorView::new(Dtype::F32, t.dims().to_vec(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| KilnError::Serialization(format!("safetensors view error: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let serialized = serialize(views, &None)
        .map_err(|e| KilnError::Serialization(format!("safetensors serialize error: {e}")))?;
    std::fs::write(path, serialized)?;
    debug!(path = %path.display(), tensors = state_dict.len(), "saved state dict");
    Ok(())
}

/// Load a state dictionary from a safetensors file.
///
/// F32, F16 and BF16 tensors are accepted; half-precision values are widened.
pub fn load_state_dict(path: &Path) -> Result<HashMap<String, Tensor>> {
    let data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data)
        .map_err(|e| KilnError::Serialization(format!("safetensors parse error: {e}")))?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| -> Result<(String, Tensor)> { Ok((name, view_to_tensor(&view)?)) })
        .collect()
}

/// Save a Module's parameters to a safetensors file.
pub fn save_module<M: Module + ?Sized>(module: &M, path: &Path) -> Result<()> {
    save_state_dict(&module.state_dict(), path)
}

/// Copy weights from a safetensors file into `module`, matched by name.
///
/// Every parameter of the module must be present with the same shape.
pub fn load_module<M: Module + ?Sized>(module: &mut M, path: &Path) -> Result<()> {
    let state = load_state_dict(path)?;
    let names: Vec<String> = module.named_parameters().into_iter().map(|(n, _)| n).collect();

    for (name, param) in names.iter().zip(module.parameters_mut()) {
        let stored = state
            .get(name)
            .ok_or_else(|| KilnError::Serialization(format!("missing parameter '{name}'")))?;
        if stored.dims() != param.dims() {
            return Err(KilnError::ShapeMismatch { expected: param.dims().to_vec(), got: stored.dims().to_vec() });
        }
        param.as_mut_slice().copy_from_slice(stored.as_slice());
    }
    debug!(path = %path.display(), parameters = names.len(), "loaded module weights");
    Ok(())
}

fn view_to_tensor(view: &TensorView<'_>) -> Result<Tensor> {
    let data = view.data();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => data.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])).collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect(),
        other => {
            return Err(KilnError::Serialization(format!("unsupported safetensors dtype: {other:?}")));
        }
    };
    Tensor::from_vec(values, view.shape())
}

// ============================================================================
// Inference graph export
// ============================================================================

/// Name and shape of one exported parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

/// Portable description of a model's inference interface.
///
/// The sample input is traced once in eval mode to record the output shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceGraph {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub parameters: Vec<ParameterInfo>,
    pub num_parameters: usize,
    /// Sibling safetensors file holding the weights, if known.
    pub weights: Option<String>,
}

/// Trace `module` on `sample_input` and write the manifest to `path` as JSON.
///
/// The module runs with grad disabled and in eval mode; its previous mode is
/// restored afterwards.
pub fn export_inference_graph<M: Module + ?Sized>(
    module: &mut M,
    sample_input: &Tensor,
    path: &Path,
    weights: Option<&str>,
) -> Result<InferenceGraph> {
    let was_training = module.is_training();
    module.train(false);
    let traced = {
        let _guard = NoGradGuard::new();
        module.forward(sample_input)
    };
    module.train(was_training);
    let output = traced?;

    let parameters: Vec<ParameterInfo> = module
        .named_parameters()
        .into_iter()
        .map(|(name, t)| ParameterInfo { name, shape: t.dims().to_vec() })
        .collect();

    let graph = InferenceGraph {
        input_names: vec!["features".to_string()],
        output_names: vec!["logits".to_string()],
        input_shape: sample_input.dims().to_vec(),
        output_shape: output.dims().to_vec(),
        num_parameters: module.num_parameters(),
        parameters,
        weights: weights.map(str::to_string),
    };

    let json = serde_json::to_string_pretty(&graph)
        .map_err(|e| KilnError::Serialization(format!("graph export error: {e}")))?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), "exported inference graph");
    Ok(graph)
}

/// Read a manifest written by [`export_inference_graph`].
pub fn load_inference_graph(path: &Path) -> Result<InferenceGraph> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| KilnError::Serialization(format!("graph parse error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dropout, LayerNorm, Linear};

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.safetensors");
        let layer = Linear::new(4, 3, true);
        let sd = layer.state_dict();

        save_state_dict(&sd, &path).unwrap();
        let loaded = load_state_dict(&path).unwrap();
        assert_eq!(loaded["weight"].dims(), &[3, 4]);
        assert_eq!(loaded["weight"].as_slice(), sd["weight"].as_slice());
        assert_eq!(loaded["bias"].as_slice(), sd["bias"].as_slice());
    }

    #[test]
    fn test_load_module_assigns_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ln.safetensors");
        let mut source = LayerNorm::new(3, true);
        source.parameters_mut()[0].as_mut_slice().copy_from_slice(&[2.0, 3.0, 4.0]);
        save_module(&source, &path).unwrap();

        let mut target = LayerNorm::new(3, true);
        load_module(&mut target, &path).unwrap();
        assert_eq!(target.weight().as_slice(), &[2.0, 3.0, 4.0]);
        assert!(target.weight().requires_grad());

        let mut wrong = LayerNorm::new(4, true);
        assert!(load_module(&mut wrong, &path).is_err());
    }

    #[test]
    fn test_load_half_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let view = TensorView::new(Dtype::F16, vec![2], &bytes).unwrap();
        std::fs::write(&path, serialize([("w", view)], &None).unwrap()).unwrap();

        let loaded = load_state_dict(&path).unwrap();
        assert_eq!(loaded["w"].as_slice(), &[1.5, -2.0]);
    }

    #[test]
    fn test_export_inference_graph_restores_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.graph.json");
        let mut layer = Linear::new(4, 2, true);
        let graph = export_inference_graph(&mut layer, &Tensor::ones(&[3, 4]), &path, Some("model.safetensors")).unwrap();
        assert_eq!(graph.input_names, vec!["features"]);
        assert_eq!(graph.output_names, vec!["logits"]);
        assert_eq!(graph.output_shape, vec![3, 2]);
        assert_eq!(graph.num_parameters, 10);
        assert_eq!(load_inference_graph(&path).unwrap(), graph);

        let mut dropout = Dropout::new(0.5).unwrap();
        export_inference_graph(&mut dropout, &Tensor::ones(&[2]), &path, None).unwrap();
        assert!(dropout.is_training());
    }
}
