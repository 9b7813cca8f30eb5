//! Constant pool attached to a bytecode array

use serde::{Deserialize, Serialize};

/// A constant value in the constant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// Small integer
    Smi(i32),
    /// Heap number
    Number(f64),
    /// Internalized string (property names, literals)
    String(Box<str>),
    /// Nested function literal, by index into the script's function table
    Function(u32),
}

impl Constant {
    /// Create a string constant
    #[inline]
    pub fn string(s: impl Into<Box<str>>) -> Self {
        Self::String(s.into())
    }

    /// Get as string if this is a string constant
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Smi(value) => write!(f, "{value}"),
            Constant::Number(value) => write!(f, "{value:?}"),
            Constant::String(s) => write!(f, "{s:?}"),
            Constant::Function(index) => write!(f, "<function #{index}>"),
        }
    }
}

/// Constant pool with deduplication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantPool {
    constants: Vec<Constant>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant to the pool, returns its index.
    /// Identical constants share one slot.
    pub fn add(&mut self, constant: Constant) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Get constant by index
    #[inline]
    pub fn get(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Number of constants
    #[inline]
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    /// True if the pool holds nothing
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Heap footprint: one tagged slot per entry
    pub fn size_in_bytes(&self) -> usize {
        self.constants.len() * std::mem::size_of::<u64>()
    }

    /// Iterate over constants
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::string("x"));
        let b = pool.add(Constant::Smi(1));
        let c = pool.add(Constant::string("x"));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.size_in_bytes(), 16);
        assert_eq!(pool.get(a).and_then(Constant::as_str), Some("x"));
    }
}
