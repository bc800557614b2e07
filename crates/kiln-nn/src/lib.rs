//! # kiln-nn
//!
//! Neural network layers, losses, persistence and the supervised training
//! loop for kiln.

pub mod module;
pub mod linear;
pub mod embedding;
pub mod layer_norm;
pub mod dropout;
pub mod activations;
pub mod recurrent;
pub mod loss;
pub mod metrics;
pub mod serialization;
pub mod trainer;
pub mod prelude;

pub use module::Module;
pub use linear::Linear;
pub use embedding::Embedding;
pub use layer_norm::LayerNorm;
pub use dropout::Dropout;
pub use activations::Activation;
pub use recurrent::{extract_final_layer_hidden, CellKind, LastTimeStep, RecurrentOutput, RecurrentState, Rnn};
pub use loss::{cross_entropy_language_model, cross_entropy_loss, LossFn};
pub use metrics::{accuracy, MetricTable, ScoreFn, ScoreFns};
pub use serialization::{
    export_inference_graph, load_inference_graph, load_module, load_state_dict, save_module, save_state_dict,
    InferenceGraph,
};
pub use trainer::{score_fn, SaveConfig, Trainer, TrainingConfig};
