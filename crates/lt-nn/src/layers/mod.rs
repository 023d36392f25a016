pub mod activation;
pub mod conv;
pub mod linear;
pub mod normalization;
pub mod sequential;

pub use activation::{LeakyRelu, Relu, Tanh};
pub use conv::{AvgPool2d, Conv2d, ConvTranspose2d, Upsample2d};
pub use linear::Linear;
pub use normalization::BatchNorm2d;
pub use sequential::Sequential;
