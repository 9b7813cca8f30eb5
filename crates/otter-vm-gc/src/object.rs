//! Mark state shared by the marker and heap objects

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkColor {
    /// Not yet visited
    #[default]
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

impl MarkColor {
    /// Decode a color from its byte form; anything above gray is black.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => MarkColor::White,
            1 => MarkColor::Gray,
            _ => MarkColor::Black,
        }
    }
}
