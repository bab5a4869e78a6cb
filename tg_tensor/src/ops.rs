//! Operation descriptors shared by the backends.
//!
//! Each backend evaluates these with its own kernels; the numeric codes are
//! the selectors used by the device kernels.

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

/// Elementwise unary operations, including the derivatives used by autograd.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Sign,
    Exp,
    Log,
    Relu,
    LeakyRelu(f32),
    Sigmoid,
    Tanh,
    Gelu,
    ReluGrad,
    LeakyReluGrad(f32),
    SigmoidGrad,
    TanhGrad,
    GeluGrad,
}

impl UnaryOp {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::LeakyRelu(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Gelu => {
                let u = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                0.5 * x * (1.0 + u.tanh())
            }
            UnaryOp::ReluGrad => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::LeakyReluGrad(alpha) => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            UnaryOp::SigmoidGrad => {
                let s = 1.0 / (1.0 + (-x).exp());
                s * (1.0 - s)
            }
            UnaryOp::TanhGrad => {
                let t = x.tanh();
                1.0 - t * t
            }
            UnaryOp::GeluGrad => {
                let u = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                let t = u.tanh();
                let du = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * du
            }
        }
    }

    /// Kernel selector and parameter.
    pub fn code(self) -> (i32, f32) {
        match self {
            UnaryOp::Neg => (0, 0.0),
            UnaryOp::Abs => (1, 0.0),
            UnaryOp::Sqrt => (2, 0.0),
            UnaryOp::Sign => (3, 0.0),
            UnaryOp::Exp => (4, 0.0),
            UnaryOp::Log => (5, 0.0),
            UnaryOp::Relu => (6, 0.0),
            UnaryOp::LeakyRelu(alpha) => (7, alpha),
            UnaryOp::Sigmoid => (8, 0.0),
            UnaryOp::Tanh => (9, 0.0),
            UnaryOp::Gelu => (10, 0.0),
            UnaryOp::ReluGrad => (11, 0.0),
            UnaryOp::LeakyReluGrad(alpha) => (12, alpha),
            UnaryOp::SigmoidGrad => (13, 0.0),
            UnaryOp::TanhGrad => (14, 0.0),
            UnaryOp::GeluGrad => (15, 0.0),
        }
    }
}

/// Elementwise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
}

impl BinaryOp {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
        }
    }

    pub fn code(self) -> i32 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
            BinaryOp::Pow => 4,
            BinaryOp::Max => 5,
            BinaryOp::Min => 6,
        }
    }
}

/// Full reductions to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    /// Sum of squared elements.
    SumSquares,
}

impl ReduceOp {
    pub fn identity(self) -> f32 {
        match self {
            ReduceOp::Sum | ReduceOp::SumSquares => 0.0,
            ReduceOp::Max => f32::NEG_INFINITY,
            ReduceOp::Min => f32::INFINITY,
        }
    }

    /// Fold one input element into the accumulator.
    pub fn accumulate(self, acc: f32, x: f32) -> f32 {
        match self {
            ReduceOp::Sum => acc + x,
            ReduceOp::SumSquares => acc + x * x,
            ReduceOp::Max => acc.max(x),
            ReduceOp::Min => acc.min(x),
        }
    }

    /// Combine two partial results.
    pub fn merge(self, a: f32, b: f32) -> f32 {
        match self {
            ReduceOp::Sum | ReduceOp::SumSquares => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Max => 1,
            ReduceOp::Min => 2,
            ReduceOp::SumSquares => 3,
        }
    }
}

/// Activation functions applied by `activate` and `activate_grad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Linear,
    Relu,
    LeakyRelu(f32),
    Sigmoid,
    Tanh,
    Gelu,
    /// Softmax over the last axis.
    Softmax,
}

impl Activation {
    /// Elementwise forward op, `None` for identity and softmax.
    pub fn forward_op(self) -> Option<UnaryOp> {
        match self {
            Activation::Linear | Activation::Softmax => None,
            Activation::Relu => Some(UnaryOp::Relu),
            Activation::LeakyRelu(alpha) => Some(UnaryOp::LeakyRelu(alpha)),
            Activation::Sigmoid => Some(UnaryOp::Sigmoid),
            Activation::Tanh => Some(UnaryOp::Tanh),
            Activation::Gelu => Some(UnaryOp::Gelu),
        }
    }

    /// Derivative evaluated at the activation input, `None` for identity and softmax.
    pub fn derivative_op(self) -> Option<UnaryOp> {
        match self {
            Activation::Linear | Activation::Softmax => None,
            Activation::Relu => Some(UnaryOp::ReluGrad),
            Activation::LeakyRelu(alpha) => Some(UnaryOp::LeakyReluGrad(alpha)),
            Activation::Sigmoid => Some(UnaryOp::SigmoidGrad),
            Activation::Tanh => Some(UnaryOp::TanhGrad),
            Activation::Gelu => Some(UnaryOp::GeluGrad),
        }
    }
}

/// Stride and symmetric zero padding for batched `conv2d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dParams {
    pub stride: usize,
    pub padding: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            stride: 1,
            padding: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_diff(op: UnaryOp, x: f32) -> f32 {
        let eps = 1e-3;
        (op.apply(x + eps) - op.apply(x - eps)) / (2.0 * eps)
    }

    #[test]
    fn test_unary_values() {
        assert_eq!(UnaryOp::Sign.apply(-2.5), -1.0);
        assert_eq!(UnaryOp::Sign.apply(0.0), 0.0);
        assert_eq!(UnaryOp::Relu.apply(-1.0), 0.0);
        assert_eq!(UnaryOp::LeakyRelu(0.1).apply(-2.0), -0.2);
        assert!((UnaryOp::Sigmoid.apply(0.0) - 0.5).abs() < 1e-7);
        assert!(UnaryOp::Gelu.apply(0.0).abs() < 1e-7);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let pairs = [
            (Activation::Sigmoid, 0.3f32),
            (Activation::Tanh, -0.7),
            (Activation::Gelu, 0.9),
            (Activation::Gelu, -1.2),
            (Activation::LeakyRelu(0.2), -0.5),
            (Activation::Relu, 1.5),
        ];
        for (act, x) in pairs {
            let fwd = act.forward_op().unwrap();
            let grad = act.derivative_op().unwrap();
            let err = (grad.apply(x) - finite_diff(fwd, x)).abs();
            assert!(err < 1e-2, "{act:?} at {x}: err {err}");
        }
    }

    #[test]
    fn test_reduce_merge() {
        let data = [1.0f32, -3.0, 2.0];
        let op = ReduceOp::SumSquares;
        let sq = data
            .iter()
            .fold(op.identity(), |acc, &x| op.accumulate(acc, x));
        assert_eq!(sq, 14.0);
        assert_eq!(ReduceOp::SumSquares.merge(4.0, 10.0), 14.0);
        assert_eq!(ReduceOp::Max.merge(1.0, 3.0), 3.0);
    }

    #[test]
    fn test_linear_and_softmax_have_no_elementwise_op() {
        assert!(Activation::Linear.forward_op().is_none());
        assert!(Activation::Softmax.derivative_op().is_none());
    }
}
