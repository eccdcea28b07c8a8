#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("coordinate ({x}, {y}) is outside the canvas")]
    InvalidCoordinate { x: i64, y: i64 },
    #[error("unknown color: {0}")]
    UnknownColor(String),
}
