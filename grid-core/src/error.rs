use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("cell ({row}, {col}) is outside the {rows}x{cols} grid")]
    InvalidCoordinate {
        row: u32,
        col: u32,
        rows: u32,
        cols: u32,
    },
    #[error("cannot parse cell label '{0}'")]
    ParseCell(String),
}
