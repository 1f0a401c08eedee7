use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Compiler error: {0}")]
    Compiler(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid capability descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid library reference: {0}")]
    InvalidReference(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
