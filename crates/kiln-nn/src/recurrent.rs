//! Multi-layer, optionally bidirectional recurrent layers.
//!
//! Input is batch-first `[B, T, D]`. Parameters follow the
//! `weight_ih_l{k}[_reverse]` naming so state dicts line up with other
//! toolkits.

use kiln_core::{KilnError, Result, Tensor};

use crate::module::Module;

/// Recurrent cell type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// h' = tanh(W_ih x + b_ih + W_hh h + b_hh)
    Tanh,
    /// Gated cell with input, forget, cell and output gates.
    Lstm,
}

impl CellKind {
    fn gates(self) -> usize {
        match self {
            CellKind::Tanh => 1,
            CellKind::Lstm => 4,
        }
    }
}

/// Final hidden state(s), each `[layers·dirs, B, H]`.
#[derive(Debug, Clone)]
pub enum RecurrentState {
    Single(Tensor),
    /// `(h_n, c_n)`
    Gated(Tensor, Tensor),
}

impl RecurrentState {
    /// The hidden state `h_n`.
    pub fn primary(&self) -> &Tensor {
        match self {
            RecurrentState::Single(h) | RecurrentState::Gated(h, _) => h,
        }
    }
}

/// Full sequence output `[B, T, H·dirs]` plus the final state.
#[derive(Debug, Clone)]
pub struct RecurrentOutput {
    pub output: Tensor,
    pub state: RecurrentState,
}

struct CellParams {
    weight_ih: Tensor,
    weight_hh: Tensor,
    bias_ih: Tensor,
    bias_hh: Tensor,
}

impl CellParams {
    fn new(input_size: usize, hidden_size: usize, gates: usize) -> Self {
        let bound = 1.0 / (hidden_size.max(1) as f32).sqrt();
        let param = |dims: &[usize]| {
            let mut t = Tensor::rand_uniform(dims, -bound, bound);
            t.set_requires_grad(true);
            t
        };
        Self {
            weight_ih: param(&[gates * hidden_size, input_size]),
            weight_hh: param(&[gates * hidden_size, hidden_size]),
            bias_ih: param(&[gates * hidden_size]),
            bias_hh: param(&[gates * hidden_size]),
        }
    }
}

/// Stacked recurrent layer.
pub struct Rnn {
    cell: CellKind,
    hidden_size: usize,
    num_layers: usize,
    bidirectional: bool,
    // layer-major, direction-minor
    cells: Vec<CellParams>,
}

impl Rnn {
    pub fn new(
        cell: CellKind,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        if hidden_size == 0 || num_layers == 0 {
            return Err(KilnError::InvalidConfig("rnn hidden_size and num_layers must be > 0".into()));
        }
        let directions = if bidirectional { 2 } else { 1 };
        let mut cells = Vec::with_capacity(num_layers * directions);
        for layer in 0..num_layers {
            let layer_input = if layer == 0 { input_size } else { hidden_size * directions };
            for _ in 0..directions {
                cells.push(CellParams::new(layer_input, hidden_size, cell.gates()));
            }
        }
        Ok(Self { cell, hidden_size, num_layers, bidirectional, cells })
    }

    pub fn cell(&self) -> CellKind {
        self.cell
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Run the whole stack over `[B, T, D]`.
    pub fn run(&self, input: &Tensor) -> Result<RecurrentOutput> {
        if input.ndim() != 3 {
            return Err(KilnError::ShapeMismatch { expected: vec![0, 0, 0], got: input.dims().to_vec() });
        }
        let (batch, steps) = (input.dims()[0], input.dims()[1]);
        let directions = self.directions();

        let mut layer_input: Vec<Tensor> = (0..steps).map(|t| input.select(1, t)).collect::<Result<_>>()?;
        let mut final_h = Vec::with_capacity(self.cells.len());
        let mut final_c = Vec::with_capacity(self.cells.len());

        for layer in 0..self.num_layers {
            let mut per_direction = Vec::with_capacity(directions);
            for dir in 0..directions {
                let params = &self.cells[layer * directions + dir];
                let (outputs, h, c) = self.run_direction(params, &layer_input, batch, dir == 1)?;
                per_direction.push(outputs);
                final_h.push(h);
                final_c.push(c);
            }

            layer_input = if directions == 1 {
                per_direction.pop().unwrap_or_default()
            } else {
                (0..steps)
                    .map(|t| Tensor::cat(&[&per_direction[0][t], &per_direction[1][t]], -1))
                    .collect::<Result<_>>()?
            };
        }

        let output = if steps == 0 {
            Tensor::zeros(&[batch, 0, self.hidden_size * directions])
        } else {
            let refs: Vec<&Tensor> = layer_input.iter().collect();
            Tensor::stack(&refs, 1)?
        };

        let h_n = Tensor::stack(&final_h.iter().collect::<Vec<_>>(), 0)?;
        let state = match self.cell {
            CellKind::Tanh => RecurrentState::Single(h_n),
            CellKind::Lstm => RecurrentState::Gated(h_n, Tensor::stack(&final_c.iter().collect::<Vec<_>>(), 0)?),
        };
        Ok(RecurrentOutput { output, state })
    }

    /// One direction of one layer. Returns per-step outputs in time order
    /// plus the final `(h, c)`.
    fn run_direction(
        &self,
        params: &CellParams,
        inputs: &[Tensor],
        batch: usize,
        reverse: bool,
    ) -> Result<(Vec<Tensor>, Tensor, Tensor)> {
        let hs = self.hidden_size;
        let w_ih_t = params.weight_ih.transpose(0, 1)?;
        let w_hh_t = params.weight_hh.transpose(0, 1)?;

        let mut h = Tensor::zeros(&[batch, hs]);
        let mut c = Tensor::zeros(&[batch, hs]);
        let mut outputs: Vec<Option<Tensor>> = vec![None; inputs.len()];

        let order: Vec<usize> = if reverse { (0..inputs.len()).rev().collect() } else { (0..inputs.len()).collect() };
        for t in order {
            let pre = inputs[t]
                .matmul(&w_ih_t)?
                .add(&params.bias_ih)?
                .add(&h.matmul(&w_hh_t)?.add(&params.bias_hh)?)?;

            match self.cell {
                CellKind::Tanh => h = pre.tanh()?,
                CellKind::Lstm => {
                    let i = pre.narrow(1, 0, hs)?.sigmoid()?;
                    let f = pre.narrow(1, hs, hs)?.sigmoid()?;
                    let g = pre.narrow(1, 2 * hs, hs)?.tanh()?;
                    let o = pre.narrow(1, 3 * hs, hs)?.sigmoid()?;
                    c = f.mul(&c)?.add(&i.mul(&g)?)?;
                    h = o.mul(&c.tanh()?)?;
                }
            }
            outputs[t] = Some(h.clone());
        }

        Ok((outputs.into_iter().flatten().collect(), h, c))
    }
}

impl Module for Rnn {
    /// Sequence output only; use [`Rnn::run`] for the final state.
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(self.run(input)?.output)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let directions = self.directions();
        let mut params = Vec::with_capacity(self.cells.len() * 4);
        for (idx, cell) in self.cells.iter().enumerate() {
            let suffix = format!("l{}{}", idx / directions, if idx % directions == 1 { "_reverse" } else { "" });
            params.push((format!("weight_ih_{suffix}"), &cell.weight_ih));
            params.push((format!("weight_hh_{suffix}"), &cell.weight_hh));
            params.push((format!("bias_ih_{suffix}"), &cell.bias_ih));
            params.push((format!("bias_hh_{suffix}"), &cell.bias_hh));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.cells
            .iter_mut()
            .flat_map(|c| [&mut c.weight_ih, &mut c.weight_hh, &mut c.bias_ih, &mut c.bias_hh])
            .collect()
    }
}

/// Last layer's final hidden state with directions concatenated.
///
/// `h_n` is `[layers·dirs, B, H]`; the result is `[B, dirs·H]`.
pub fn extract_final_layer_hidden(h_n: &Tensor, layers: usize, directions: usize) -> Result<Tensor> {
    if h_n.ndim() != 3 || layers == 0 || h_n.dims()[0] != layers * directions {
        return Err(KilnError::ShapeMismatch {
            expected: vec![layers * directions, 0, 0],
            got: h_n.dims().to_vec(),
        });
    }
    let (batch, hidden) = (h_n.dims()[1], h_n.dims()[2]);
    h_n.reshape(&[layers as isize, directions as isize, batch as isize, hidden as isize])?
        .select(0, layers - 1)?
        .permute(&[1, 0, 2])?
        .reshape(&[batch as isize, (directions * hidden) as isize])
}

/// Reduces a recurrent state to one fixed-size vector per sequence.
#[derive(Debug, Clone, Copy)]
pub struct LastTimeStep {
    layers: usize,
    directions: usize,
}

impl LastTimeStep {
    pub fn new(layers: usize, bidirectional: bool) -> Self {
        Self { layers, directions: if bidirectional { 2 } else { 1 } }
    }

    pub fn apply(&self, state: &RecurrentState) -> Result<Tensor> {
        extract_final_layer_hidden(state.primary(), self.layers, self.directions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rnn_output_and_state_shapes() {
        let rnn = Rnn::new(CellKind::Tanh, 3, 5, 2, false).unwrap();
        let out = rnn.run(&Tensor::randn(&[4, 6, 3], 1.0)).unwrap();
        assert_eq!(out.output.dims(), &[4, 6, 5]);
        assert_eq!(out.state.primary().dims(), &[2, 4, 5]);
        assert!(matches!(out.state, RecurrentState::Single(_)));
    }

    #[test]
    fn test_bidirectional_lstm_shapes() {
        let rnn = Rnn::new(CellKind::Lstm, 3, 4, 2, true).unwrap();
        let out = rnn.run(&Tensor::randn(&[2, 5, 3], 1.0)).unwrap();
        assert_eq!(out.output.dims(), &[2, 5, 8]);
        match &out.state {
            RecurrentState::Gated(h, c) => {
                assert_eq!(h.dims(), &[4, 2, 4]);
                assert_eq!(c.dims(), &[4, 2, 4]);
            }
            RecurrentState::Single(_) => panic!("lstm must return a gated state"),
        }
        assert_eq!(rnn.named_parameters().len(), 16);
        assert!(rnn.state_dict().contains_key("weight_ih_l1_reverse"));
    }

    #[test]
    fn test_final_hidden_matches_last_output_step() {
        let rnn = Rnn::new(CellKind::Tanh, 2, 3, 1, false).unwrap();
        let out = rnn.run(&Tensor::randn(&[2, 4, 2], 1.0)).unwrap();
        let last = out.output.select(1, 3).unwrap();
        assert_eq!(last.as_slice(), out.state.primary().select(0, 0).unwrap().as_slice());
    }

    #[test]
    fn test_extract_final_layer_hidden() {
        // layers=2, dirs=2, B=1, H=2: rows are [l0f, l0b, l1f, l1b]
        let h_n = Tensor::from_f32(&[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0], &[4, 1, 2]);
        let picked = extract_final_layer_hidden(&h_n, 2, 2).unwrap();
        assert_eq!(picked.dims(), &[1, 4]);
        assert_eq!(picked.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(extract_final_layer_hidden(&h_n, 3, 2).is_err());
    }

    #[test]
    fn test_last_time_step_and_backward() {
        let rnn = Rnn::new(CellKind::Lstm, 2, 3, 1, true).unwrap();
        let out = rnn.run(&Tensor::randn(&[2, 3, 2], 1.0)).unwrap();
        let summary = LastTimeStep::new(1, true).apply(&out.state).unwrap();
        assert_eq!(summary.dims(), &[2, 6]);
        summary.sum().unwrap().backward().unwrap();
        assert!(rnn.parameters().iter().all(|p| p.grad().is_some()));
    }
}
