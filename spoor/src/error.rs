#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Mvg {
        #[from]
        source: spoor_mvg::MvgError,
    },
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    SerdeYaml {
        #[from]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    FatalConfig(String),
    #[error("input violates tracker contract: {0}")]
    InputViolation(String),
}

pub type Result<M> = std::result::Result<M, Error>;
