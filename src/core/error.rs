use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("arithmetic overflow in trial {trial}")]
    Overflow { trial: u32 },

    #[error("duration distribution: {0}")]
    Distribution(String),
}
