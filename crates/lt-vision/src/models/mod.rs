pub mod age;
pub mod introvae;

pub use age::{AgeConfig, AgeEncoder, AgeGenerator};
pub use introvae::{
    reparameterize, IntroConfig, IntroEncoder, IntroGenerator, ResidualBlock, ResidualKind,
};
