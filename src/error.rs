use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Unrecognized layout in {file}: {details}")]
    Format { file: String, details: String },

    #[error("Pivot cache extraction failed: {0}")]
    Extraction(String),

    #[error("Date calculation error: {0}")]
    Date(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn format(file: impl Into<String>, details: impl Into<String>) -> Self {
        EtlError::Format {
            file: file.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
