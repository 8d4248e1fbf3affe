use std::fmt;

#[cfg(feature = "clap")]
use clap::ValueEnum;

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum DType {
    // Only dtype currently supported by the `ort` engine
    #[default]
    Float32,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DType::Float32 => write!(f, "float32"),
        }
    }
}
