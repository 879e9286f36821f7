#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}
