//! # kiln-transformer
//!
//! Small autoregressive language models:
//! - `BigramLanguageModel`: one embedding table of next-token logits
//! - `RnnClassifier`: embedding, recurrent stack and a linear head
//! - `AttentionHead` / `MultiHeadAttention`: causal self-attention
//! - `FeedForward`: position-wise `D → 4D → D` projection
//! - `TransformerBlock`: one block, norm placement set by `BlockArrangement`
//! - `DecoderStack`: embeddings, blocks and vocabulary head per `DecoderVariant`
//! - `generate`: stochastic autoregressive sampling

pub mod config;
pub mod attention;
pub mod feed_forward;
pub mod block;
pub mod model;
pub mod bigram;
pub mod recurrent;
pub mod sampler;

pub use config::ModelConfig;
pub use attention::{AttentionHead, CausalMask, MultiHeadAttention};
pub use feed_forward::FeedForward;
pub use block::{BlockArrangement, TransformerBlock};
pub use model::{DecoderStack, DecoderVariant};
pub use bigram::BigramLanguageModel;
pub use recurrent::RnnClassifier;
pub use sampler::{generate, generate_tokens, LanguageModel};
