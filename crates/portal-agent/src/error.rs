use thiserror::Error;

/// Errors surfaced by the lifecycle manager. Every internal fault is converted
/// into one of these at the component boundary, keeping the original text.
#[derive(Error, Debug)]
pub enum PortalError {
    /// The metadata endpoint was unreachable, returned garbage, or had no link
    /// for the requested variant.
    #[error("resolve download url failed: {0}")]
    Resolution(String),

    #[error("download failed: {0}")]
    Download(String),

    /// No image, corrupt archive, unsupported entry, or I/O during unpacking.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The operation does not fit the current process state.
    #[error("{0}")]
    State(String),

    #[error("failed to start server: {0}")]
    Start(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("properties error: {0}")]
    Properties(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PortalError>;

/// Flattens an `anyhow` chain into `outer: inner: root`, skipping repeats.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn error_chain_is_flattened_in_order() {
        let err = std::fs::read("/definitely/not/here")
            .context("read image")
            .context("open archive")
            .unwrap_err();
        let msg = format_error_chain(&err);
        assert!(msg.starts_with("open archive: read image: "));
    }

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("boom").context("boom");
        assert_eq!(format_error_chain(&err), "boom");
    }

    #[test]
    fn display_prefixes_by_kind() {
        let e = PortalError::Extraction("no image found".to_string());
        assert_eq!(e.to_string(), "extraction failed: no image found");
        let e = PortalError::State("server is not started".to_string());
        assert_eq!(e.to_string(), "server is not started");
    }
}
