use super::{Relu, Sigmoid};

/// An elementwise activation function, evaluated on pre-activations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActFn {
    Relu(Relu),
    Sigmoid(Sigmoid),
}

impl ActFn {
    pub fn relu() -> Self {
        Self::Relu(Relu::new(None))
    }

    /// A rectifier clipped at 6.
    pub fn relu6() -> Self {
        Self::Relu(Relu::new(Some(6.)))
    }

    pub fn sigmoid() -> Self {
        Self::Sigmoid(Sigmoid)
    }

    pub fn f(&self, z: f32) -> f32 {
        match self {
            Self::Relu(a) => a.f(z),
            Self::Sigmoid(a) => a.f(z),
        }
    }

    pub fn df(&self, z: f32) -> f32 {
        match self {
            Self::Relu(a) => a.df(z),
            Self::Sigmoid(a) => a.df(z),
        }
    }
}
