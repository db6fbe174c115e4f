use candle_core::{Result, Tensor};
use candle_nn::ModuleT;

/// Activations used between convolution layers
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConvActivation {
    LeakyRelu(f64),
    Relu,
}

impl ConvActivation {
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::LeakyRelu(slope) => candle_nn::ops::leaky_relu(x, *slope),
            Self::Relu => x.relu(),
        }
    }
}

/// build a stack of alternating `M` and optional activation layers
/// and keep track of every layer's output
pub struct StackLayers<M>
where
    M: ModuleT,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<ConvActivation>>,
}

impl<M> ModuleT for StackLayers<M>
where
    M: ModuleT,
{
    fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_t(&x, train)?;
            if let Some(activation) = activation {
                x = activation.apply(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: ModuleT,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: ConvActivation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.activation_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    /// Run through all the layers and return each layer's output
    /// (after its activation); the last one is the final output.
    pub fn forward_features_t(&self, input: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut features = Vec::with_capacity(self.len());
        let mut x = input.clone();
        for (module, activation) in self.module_layers.iter().zip(self.activation_layers.iter()) {
            x = module.forward_t(&x, train)?;
            if let Some(activation) = activation {
                x = activation.apply(&x)?;
            }
            features.push(x.clone());
        }
        Ok(features)
    }
}

impl<M> Default for StackLayers<M>
where
    M: ModuleT,
{
    fn default() -> Self {
        Self::new()
    }
}
