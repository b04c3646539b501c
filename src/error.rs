use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkycellError>;

#[derive(Debug, Error)]
pub enum SkycellError {
    #[error("coordinate shape mismatch: ra has {ra:?}, dec has {dec:?}")]
    ShapeMismatch { ra: Vec<usize>, dec: Vec<usize> },

    #[error("invalid geometry table: {message}")]
    InvalidGrid { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("invalid cell-to-file table at line {line}: {message}")]
    InvalidFileTable { line: usize, message: String },

    #[error("image {} has no finite samples", path.display())]
    EmptyImage { path: PathBuf },

    #[error("FITS error in {}: {}", path.display(), message)]
    Fits { path: PathBuf, message: String },

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("invalid file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SkycellError {
    pub fn shape_mismatch(ra: &[usize], dec: &[usize]) -> Self {
        Self::ShapeMismatch {
            ra: ra.to_vec(),
            dec: dec.to_vec(),
        }
    }

    pub fn invalid_grid(message: impl Into<String>) -> Self {
        Self::InvalidGrid {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_file_table(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidFileTable {
            line,
            message: message.into(),
        }
    }

    pub fn fits(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Fits {
            path: path.into(),
            message: message.into(),
        }
    }
}
