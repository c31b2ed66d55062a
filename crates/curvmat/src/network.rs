//! # Sequential Networks - The Host Traversal
//!
//! A small host for the per-layer extensions: layers chained in a
//! [`Diagram`], a forward pass that records every layer's
//! [`LayerContext`], and backward passes that visit the layers in reverse
//! topological order, each exactly once, threading backproped state from
//! output to input.
//!
//! - [`Sequential::forward_backward`]: first-order pass, records contexts
//! - [`Sequential::curvature_pass`]: threads curvature operators
//! - [`Sequential::backpropagate_matrices`]: threads plain matrices
//!
//! ## Example
//!
//! ```rust
//! use hbp_curvmat::derivatives::{one_hot, CrossEntropyLoss, Linear};
//! use hbp_curvmat::extension::CurvatureExtension;
//! use hbp_curvmat::matprod::CurvatureMatProd;
//! use hbp_curvmat::network::{Layer, Sequential};
//! use hbp_curvmat::Curvature;
//! use ndarray::array;
//!
//! let mut net = Sequential::new(2);
//! net.push(Layer::Linear(Linear::random(2, 3, 0))).unwrap();
//! net.push(Layer::Sigmoid).unwrap();
//! net.push(Layer::Linear(Linear::random(3, 2, 1))).unwrap();
//!
//! let x = array![[0.5, -1.0], [1.0, 2.0]];
//! let t = one_hot(&[0, 1], 2).unwrap();
//! let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();
//!
//! let ext = CurvatureExtension::new(Curvature::PchAbs);
//! let curvature = net.curvature_pass(&record, &ext, &CrossEntropyLoss).unwrap();
//! let hv = curvature.input.apply(&x.into_dyn()).unwrap();
//! assert_eq!(hv.dim(), (2, 2, 1));
//! assert_eq!(curvature.params.len(), 4);
//! ```

use std::rc::Rc;

use hbp_core::{CoreError, Diagram, Node};
use ndarray::{Array1, Array2, Array3, Axis};
use petgraph::graph::NodeIndex;
use tracing::trace;

use crate::cmp::{CmpBackprop, LossCmp, ParamCmp};
use crate::derivatives::{
    Derivatives, Elementwise, LayerContext, Linear, LossDerivatives, ParamKind, ReLU, Sigmoid,
    Tanh,
};
use crate::error::Result;
use crate::extension::{CurvatureExtension, ModuleExtension};
use crate::jacobian::{Backproped, MatToJacMat};
use crate::matprod::MatProdRef;

/// Layers a [`Sequential`] can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear(Linear),
    ReLU,
    Sigmoid,
    Tanh,
    /// Passes activations through; has no derivatives.
    Identity,
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "Linear",
            Layer::ReLU => "ReLU",
            Layer::Sigmoid => "Sigmoid",
            Layer::Tanh => "Tanh",
            Layer::Identity => "Identity",
        }
    }

    pub fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        match self {
            Layer::Linear(linear) => linear.forward(x),
            Layer::ReLU => ReLU.forward_batch(x),
            Layer::Sigmoid => Sigmoid.forward_batch(x),
            Layer::Tanh => Tanh.forward_batch(x),
            Layer::Identity => x.clone(),
        }
    }

    /// Derivative routines, `None` for layers that are transparent.
    pub fn derivatives(&self) -> Option<&dyn Derivatives> {
        match self {
            Layer::Linear(linear) => Some(linear),
            Layer::ReLU => Some(&ReLU),
            Layer::Sigmoid => Some(&Sigmoid),
            Layer::Tanh => Some(&Tanh),
            Layer::Identity => None,
        }
    }

    pub fn as_linear(&self) -> Option<&Linear> {
        match self {
            Layer::Linear(linear) => Some(linear),
            _ => None,
        }
    }

    /// `(in, out)` widths when fed `width` features.
    fn widths(&self, width: usize) -> (usize, usize) {
        match self {
            Layer::Linear(linear) => (linear.in_dim(), linear.out_dim()),
            _ => (width, width),
        }
    }
}

impl From<Linear> for Layer {
    fn from(linear: Linear) -> Self {
        Layer::Linear(linear)
    }
}

/// Gradient of the loss w.r.t. one parameter tensor.
#[derive(Debug, Clone)]
pub struct ParamGradient {
    pub node: NodeIndex,
    pub kind: ParamKind,
    pub grad: Array1<f64>,
}

/// What a first-order pass leaves behind for the backward extensions.
#[derive(Debug, Clone)]
pub struct BackwardRecord {
    /// Nodes in forward order
    pub nodes: Vec<NodeIndex>,
    /// Context of each node, aligned with `nodes`
    pub contexts: Vec<LayerContext>,
    /// Network output
    pub output: Array2<f64>,
    /// Loss target
    pub target: Array2<f64>,
    /// Loss value
    pub loss: f64,
    /// Loss gradient w.r.t. the network input
    pub grad_input: Array2<f64>,
    /// Parameter gradients of every linear layer, weight before bias
    pub gradients: Vec<ParamGradient>,
}

impl BackwardRecord {
    pub fn gradient(&self, node: NodeIndex, kind: ParamKind) -> Option<&Array1<f64>> {
        self.gradients
            .iter()
            .find(|g| g.node == node && g.kind == kind)
            .map(|g| &g.grad)
    }
}

/// Curvature block of one parameter tensor.
pub struct ParamBlock<'a> {
    pub node: NodeIndex,
    pub kind: ParamKind,
    pub cmp: ParamCmp<'a>,
}

/// Result of a curvature pass.
pub struct NetworkCurvature<'a> {
    /// Curvature operator w.r.t. the network input
    pub input: MatProdRef<'a>,
    /// Parameter blocks in forward order, weight before bias
    pub params: Vec<ParamBlock<'a>>,
}

impl<'a> NetworkCurvature<'a> {
    pub fn block(&self, node: NodeIndex, kind: ParamKind) -> Option<&ParamBlock<'a>> {
        self.params.iter().find(|b| b.node == node && b.kind == kind)
    }
}

/// A chain of layers.
#[derive(Debug, Clone)]
pub struct Sequential {
    diagram: Diagram<Layer>,
    in_dim: usize,
}

impl Sequential {
    /// An empty network taking `in_dim` features per example.
    pub fn new(in_dim: usize) -> Self {
        Self {
            diagram: Diagram::new(),
            in_dim,
        }
    }

    /// Append a layer after the current output.
    pub fn push(&mut self, layer: impl Into<Layer>) -> Result<NodeIndex> {
        let layer = layer.into();
        let width = self.out_dim();
        let (in_width, out_width) = layer.widths(width);
        if in_width != width {
            return Err(CoreError::WidthMismatch {
                expected: in_width,
                got: width,
            }
            .into());
        }
        Ok(self.diagram.push(Node::new(layer, in_width, out_width))?)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    /// Width of the network output.
    pub fn out_dim(&self) -> usize {
        self.diagram
            .output()
            .and_then(|idx| self.diagram.node(idx).ok())
            .map_or(self.in_dim, |node| node.out_width)
    }

    pub fn len(&self) -> usize {
        self.diagram.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.diagram.node_count() == 0
    }

    pub fn diagram(&self) -> &Diagram<Layer> {
        &self.diagram
    }

    pub fn layer(&self, node: NodeIndex) -> Result<&Layer> {
        Ok(&self.diagram.node(node)?.op)
    }

    /// Nodes of linear layers in forward order.
    pub fn linear_nodes(&self) -> Result<Vec<NodeIndex>> {
        let order = self.diagram.topological_order()?;
        Ok(order
            .into_iter()
            .filter(|&idx| matches!(self.diagram.graph[idx].op, Layer::Linear(_)))
            .collect())
    }

    /// Mutable access to the linear layer at `node`.
    pub fn linear_mut(&mut self, node: NodeIndex) -> Result<&mut Linear> {
        match &mut self.diagram.node_mut(node)?.op {
            Layer::Linear(linear) => Ok(linear),
            _ => Err(CoreError::InvalidNode {
                index: node.index(),
            }
            .into()),
        }
    }

    /// Fail unless every example in `x` has `in_dim` features.
    fn check_input(&self, x: &Array2<f64>) -> Result<()> {
        if x.ncols() != self.in_dim {
            return Err(CoreError::WidthMismatch {
                expected: self.in_dim,
                got: x.ncols(),
            }
            .into());
        }
        Ok(())
    }

    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_input(x)?;
        let mut activation = x.clone();
        for idx in self.diagram.topological_order()? {
            activation = self.diagram.graph[idx].op.forward(&activation);
        }
        Ok(activation)
    }

    /// Forward, loss, and first-order backward pass.
    pub fn forward_backward(
        &self,
        x: &Array2<f64>,
        loss: &dyn LossDerivatives,
        target: &Array2<f64>,
    ) -> Result<BackwardRecord> {
        self.check_input(x)?;
        let nodes = self.diagram.topological_order()?;

        let mut inputs = Vec::with_capacity(nodes.len());
        let mut outputs = Vec::with_capacity(nodes.len());
        let mut activation = x.clone();
        for &idx in &nodes {
            let next = self.diagram.graph[idx].op.forward(&activation);
            inputs.push(activation);
            outputs.push(next.clone());
            activation = next;
        }

        let value = loss.value(&activation, target)?;
        let mut grad = loss.grad(&activation, target)?;

        let mut contexts = Vec::with_capacity(nodes.len());
        for ((&idx, input), output) in nodes.iter().zip(inputs).zip(outputs).rev() {
            let layer = &self.diagram.graph[idx].op;
            trace!(layer = layer.name(), node = idx.index(), "gradient backward");
            let mut ctx = LayerContext::new(input, output, Array2::zeros((0, 0)), grad);
            ctx.grad_input = match layer.derivatives() {
                Some(d) => d
                    .jac_t_mat_prod(&ctx, &ctx.grad_output.clone().insert_axis(Axis(2)))?
                    .index_axis_move(Axis(2), 0),
                None => ctx.grad_output.clone(),
            };
            grad = ctx.grad_input.clone();
            contexts.push(ctx);
        }
        contexts.reverse();

        let mut gradients = Vec::new();
        for (&idx, ctx) in nodes.iter().zip(&contexts) {
            if let Layer::Linear(linear) = &self.diagram.graph[idx].op {
                for kind in ParamKind::ALL {
                    gradients.push(ParamGradient {
                        node: idx,
                        kind,
                        grad: linear.param_grad(kind, ctx),
                    });
                }
            }
        }

        Ok(BackwardRecord {
            nodes,
            contexts,
            output: activation,
            target: target.clone(),
            loss: value,
            grad_input: grad,
            gradients,
        })
    }

    /// Thread curvature operators from the loss to the input.
    ///
    /// Fails at the first layer whose residual cannot be built.
    pub fn curvature_pass<'a>(
        &'a self,
        record: &'a BackwardRecord,
        ext: &CurvatureExtension,
        loss: &dyn LossDerivatives,
    ) -> Result<NetworkCurvature<'a>> {
        let mut cmp: MatProdRef<'a> =
            LossCmp.backpropagate(ext, loss, &record.output, &record.target)?;
        let mut params = Vec::new();

        for (&idx, ctx) in record.nodes.iter().zip(&record.contexts).rev() {
            let layer = &self.diagram.node(idx)?.op;
            trace!(layer = layer.name(), node = idx.index(), "curvature backward");
            if let Layer::Linear(linear) = layer {
                for kind in ParamKind::ALL {
                    params.push(ParamBlock {
                        node: idx,
                        kind,
                        cmp: ParamCmp::new(linear, kind, ctx, Rc::clone(&cmp)),
                    });
                }
            }
            if let Some(derivatives) = layer.derivatives() {
                cmp = CmpBackprop::new(derivatives).backpropagate(ext, ctx, cmp)?;
            }
        }
        params.sort_by_key(|block| block.node.index());

        Ok(NetworkCurvature { input: cmp, params })
    }

    /// Transport matrices from the output to the input through `Jᵀ`.
    pub fn backpropagate_matrices(
        &self,
        record: &BackwardRecord,
        backproped: Backproped,
    ) -> Result<Backproped> {
        let ext = CurvatureExtension::default();
        let mut state = backproped;
        for (&idx, ctx) in record.nodes.iter().zip(&record.contexts).rev() {
            let layer = &self.diagram.node(idx)?.op;
            trace!(layer = layer.name(), node = idx.index(), "matrix backward");
            state = MatToJacMat::new(layer.derivatives()).backpropagate(&ext, ctx, state)?;
        }
        Ok(state)
    }

    /// Columns of the loss-Hessian factor, each transported to the input.
    ///
    /// Returns one `(batch, in, 1)` matrix per output unit; the GGN w.r.t.
    /// the input is `Σ_c V_c V_cᵀ` per example.
    pub fn sqrt_ggn_factors(
        &self,
        record: &BackwardRecord,
        loss: &dyn LossDerivatives,
    ) -> Result<Vec<Array3<f64>>> {
        let factor = loss.sqrt_hessian(&record.output, &record.target)?;
        let columns = (0..factor.dim().2)
            .map(|c| {
                factor
                    .index_axis(Axis(2), c)
                    .insert_axis(Axis(2))
                    .to_owned()
            })
            .collect();
        Ok(self
            .backpropagate_matrices(record, Backproped::List(columns))?
            .into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curvature::Curvature;
    use crate::derivatives::{one_hot, CrossEntropyLoss, MseLoss};
    use crate::error::CurvError;
    use crate::matprod::CurvatureMatProd;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn net() -> Sequential {
        let mut net = Sequential::new(2);
        net.push(Linear::random(2, 3, 7)).unwrap();
        net.push(Layer::Tanh).unwrap();
        net.push(Layer::Identity).unwrap();
        net.push(Linear::random(3, 2, 8)).unwrap();
        net
    }

    #[test]
    fn test_push_checks_widths() {
        let mut net = Sequential::new(2);
        assert!(matches!(
            net.push(Linear::random(3, 2, 0)),
            Err(CurvError::Core(CoreError::WidthMismatch {
                expected: 3,
                got: 2
            }))
        ));
        net.push(Layer::ReLU).unwrap();
        assert_eq!(net.out_dim(), 2);
        net.push(Linear::random(2, 5, 0)).unwrap();
        assert_eq!(net.out_dim(), 5);
        assert_eq!(net.len(), 2);
    }

    #[test]
    fn test_forward_backward_records_every_layer() {
        let net = net();
        let x = array![[0.5, -1.0], [1.0, 0.25], [0.0, 2.0]];
        let t = one_hot(&[0, 1, 1], 2).unwrap();
        let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();

        assert_eq!(record.contexts.len(), 4);
        assert_eq!(record.output, net.forward(&x).unwrap());
        assert_eq!(record.gradients.len(), 4);
        // wired end to end
        for pair in record.contexts.windows(2) {
            assert_eq!(pair[0].output, pair[1].input);
            assert_eq!(pair[0].grad_output, pair[1].grad_input);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let net = net();
        let x = array![[0.5, -1.0], [1.0, 0.25]];
        let t = array![[1.0, 0.0], [0.5, 0.5]];
        let record = net.forward_backward(&x, &MseLoss, &t).unwrap();

        let h = 1e-6;
        for ((b, i), g) in record.grad_input.indexed_iter() {
            let mut xp = x.clone();
            xp[[b, i]] += h;
            let mut xm = x.clone();
            xm[[b, i]] -= h;
            let lp = MseLoss.value(&net.forward(&xp).unwrap(), &t).unwrap();
            let lm = MseLoss.value(&net.forward(&xm).unwrap(), &t).unwrap();
            assert_abs_diff_eq!((lp - lm) / (2.0 * h), *g, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_identity_layer_is_transparent() {
        let mut plain = Sequential::new(2);
        plain.push(Linear::random(2, 2, 3)).unwrap();
        let mut padded = Sequential::new(2);
        padded.push(Layer::Identity).unwrap();
        padded.push(Linear::random(2, 2, 3)).unwrap();
        padded.push(Layer::Identity).unwrap();

        let x = array![[1.0, 2.0]];
        let t = array![[0.0, 1.0]];
        let ext = CurvatureExtension::new(Curvature::Hessian);
        let rp = plain.forward_backward(&x, &MseLoss, &t).unwrap();
        let rq = padded.forward_backward(&x, &MseLoss, &t).unwrap();
        let cp = plain.curvature_pass(&rp, &ext, &MseLoss).unwrap();
        let cq = padded.curvature_pass(&rq, &ext, &MseLoss).unwrap();

        let v = array![[[1.0], [-1.0]]];
        assert_eq!(cp.input.mat_prod(&v).unwrap(), cq.input.mat_prod(&v).unwrap());
    }

    #[test]
    fn test_blocks_follow_forward_order() {
        let net = net();
        let x = array![[0.5, -1.0]];
        let t = one_hot(&[1], 2).unwrap();
        let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();
        let ext = CurvatureExtension::new(Curvature::Ggn);
        let curvature = net.curvature_pass(&record, &ext, &CrossEntropyLoss).unwrap();

        let linear = net.linear_nodes().unwrap();
        let order: Vec<_> = curvature.params.iter().map(|b| (b.node, b.kind)).collect();
        assert_eq!(
            order,
            vec![
                (linear[0], ParamKind::Weight),
                (linear[0], ParamKind::Bias),
                (linear[1], ParamKind::Weight),
                (linear[1], ParamKind::Bias),
            ]
        );
        assert_eq!(curvature.block(linear[1], ParamKind::Weight).unwrap().cmp.dim(), 6);
    }

    #[test]
    fn test_sqrt_factors_reproduce_ggn() {
        let net = net();
        let x = array![[0.5, -1.0], [1.0, 0.25]];
        let t = one_hot(&[0, 1], 2).unwrap();
        let record = net.forward_backward(&x, &CrossEntropyLoss, &t).unwrap();
        let ext = CurvatureExtension::new(Curvature::Ggn);
        let curvature = net.curvature_pass(&record, &ext, &CrossEntropyLoss).unwrap();
        let factors = net.sqrt_ggn_factors(&record, &CrossEntropyLoss).unwrap();
        assert_eq!(factors.len(), 2);

        let mat = array![[[1.0, 0.0], [0.5, 2.0]], [[-1.0, 1.0], [0.0, 3.0]]];
        let ggn = curvature.input.mat_prod(&mat).unwrap();
        for b in 0..2 {
            let m = mat.index_axis(Axis(0), b);
            let mut expected = Array2::<f64>::zeros((2, 2));
            for v in &factors {
                let vb = v.index_axis(Axis(0), b);
                expected += &vb.dot(&vb.t().dot(&m));
            }
            for ((i, c), e) in expected.indexed_iter() {
                assert_abs_diff_eq!(ggn[[b, i, c]], *e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_linear_mut_rejects_activation() {
        let mut net = net();
        let order = net.diagram().topological_order().unwrap();
        assert!(net.linear_mut(order[0]).is_ok());
        assert!(net.linear_mut(order[1]).is_err());
    }

    #[test]
    fn test_input_width_is_checked() {
        let net = net();
        let x = array![[1.0, 2.0, 3.0]];
        let width = CurvError::Core(CoreError::WidthMismatch {
            expected: 2,
            got: 3,
        });
        assert_eq!(net.forward(&x).unwrap_err().to_string(), width.to_string());
        let result = net.forward_backward(&x, &MseLoss, &array![[0.0, 0.0]]);
        assert!(matches!(
            result,
            Err(CurvError::Core(CoreError::WidthMismatch {
                expected: 2,
                got: 3
            }))
        ));
    }
}
