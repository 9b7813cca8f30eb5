//! Exception handler tables
//!
//! Optimized code uses return-address mode: each call site's return pc maps
//! to a handler. Bytecode uses range mode: `[start, end)` ranges, nested
//! handlers listed after the ranges that contain them.

/// How the runtime expects an exception to be handled.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatchPrediction {
    /// Nothing catches it
    Uncaught = 0,
    /// A local handler catches it
    Caught = 1,
    /// It rejects a promise
    Promise = 2,
    /// An async function awaits it
    AsyncAwait = 3,
    /// An async function awaits it but nothing catches it
    UncaughtAsyncAwait = 4,
}

impl CatchPrediction {
    /// Decode from the low three bits
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => CatchPrediction::Uncaught,
            1 => CatchPrediction::Caught,
            2 => CatchPrediction::Promise,
            3 => CatchPrediction::AsyncAwait,
            4 => CatchPrediction::UncaughtAsyncAwait,
            _ => return None,
        })
    }
}

const PREDICTION_BITS: u32 = 3;
const PREDICTION_MASK: u32 = (1 << PREDICTION_BITS) - 1;

fn encode_handler(handler_offset: u32, prediction: CatchPrediction) -> u32 {
    assert!(handler_offset < (1 << (32 - PREDICTION_BITS)), "handler offset too large");
    (handler_offset << PREDICTION_BITS) | prediction as u32
}

fn decode_handler(word: u32) -> (u32, CatchPrediction) {
    let prediction = match CatchPrediction::from_bits(word & PREDICTION_MASK) {
        Some(prediction) => prediction,
        None => panic!("corrupt handler table entry {word:#x}"),
    };
    (word >> PREDICTION_BITS, prediction)
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Handler found for a pc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    /// Offset of the handler code
    pub handler_offset: u32,
    /// Predicted outcome
    pub prediction: CatchPrediction,
    /// Range mode only: register holding the context
    pub data: u32,
}

/// Encodes a return-address table: `[length u32]` then
/// `[return_pc u32][handler<<3 | prediction u32]` per entry.
#[derive(Debug, Clone, Default)]
pub struct ReturnAddressTableBuilder {
    entries: Vec<(u32, u32)>,
}

impl ReturnAddressTableBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `return_pc` to a handler
    pub fn add(&mut self, return_pc: u32, handler_offset: u32, prediction: CatchPrediction) -> &mut Self {
        self.entries.push((return_pc, encode_handler(handler_offset, prediction)));
        self
    }

    /// Encode
    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * 8);
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (pc, handler) in &self.entries {
            out.extend_from_slice(&pc.to_le_bytes());
            out.extend_from_slice(&handler.to_le_bytes());
        }
        out
    }
}

/// Encodes a range table: `[start u32][end u32][handler<<3 | prediction u32][data u32]`
/// per entry, without a header.
#[derive(Debug, Clone, Default)]
pub struct RangeTableBuilder {
    entries: Vec<[u32; 4]>,
}

impl RangeTableBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`; inner ranges must come after the ranges they nest in.
    pub fn add(
        &mut self,
        start: u32,
        end: u32,
        handler_offset: u32,
        prediction: CatchPrediction,
        data: u32,
    ) -> &mut Self {
        debug_assert!(start <= end);
        self.entries
            .push([start, end, encode_handler(handler_offset, prediction), data]);
        self
    }

    /// Encode
    pub fn finish(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|entry| entry.iter().flat_map(|word| word.to_le_bytes()))
            .collect()
    }
}

/// Read-only view of an encoded handler table
#[derive(Debug, Clone, Copy)]
pub enum HandlerTable<'a> {
    /// Return-address mode
    ReturnAddress(&'a [u8]),
    /// Range mode
    Range(&'a [u8]),
}

impl<'a> HandlerTable<'a> {
    /// Wrap a return-address table
    pub fn return_address(bytes: &'a [u8]) -> Self {
        if !bytes.is_empty() {
            assert_eq!(bytes.len(), 4 + read_u32(bytes, 0) as usize * 8, "corrupt handler table");
        }
        HandlerTable::ReturnAddress(bytes)
    }

    /// Wrap a range table
    pub fn range(bytes: &'a [u8]) -> Self {
        assert_eq!(bytes.len() % 16, 0, "corrupt handler table");
        HandlerTable::Range(bytes)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        match self {
            HandlerTable::ReturnAddress(bytes) if bytes.is_empty() => 0,
            HandlerTable::ReturnAddress(bytes) => read_u32(bytes, 0) as usize,
            HandlerTable::Range(bytes) => bytes.len() / 16,
        }
    }

    /// True without entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler for the call returning to `return_pc`
    pub fn lookup_return(&self, return_pc: u32) -> Option<HandlerInfo> {
        let HandlerTable::ReturnAddress(bytes) = self else {
            panic!("lookup_return on a range table");
        };
        (0..self.len()).find_map(|i| {
            let at = 4 + i * 8;
            (read_u32(bytes, at) == return_pc).then(|| {
                let (handler_offset, prediction) = decode_handler(read_u32(bytes, at + 4));
                HandlerInfo {
                    handler_offset,
                    prediction,
                    data: 0,
                }
            })
        })
    }

    /// Innermost handler whose range covers `pc_offset`
    pub fn lookup_range(&self, pc_offset: u32) -> Option<HandlerInfo> {
        let HandlerTable::Range(bytes) = self else {
            panic!("lookup_range on a return-address table");
        };
        let mut innermost = None;
        for entry in bytes.chunks_exact(16) {
            let start = read_u32(entry, 0);
            let end = read_u32(entry, 4);
            if pc_offset < start {
                break;
            }
            if pc_offset >= end {
                continue;
            }
            let (handler_offset, prediction) = decode_handler(read_u32(entry, 8));
            innermost = Some(HandlerInfo {
                handler_offset,
                prediction,
                data: read_u32(entry, 12),
            });
        }
        innermost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_address_lookup() {
        let mut builder = ReturnAddressTableBuilder::new();
        builder
            .add(12, 100, CatchPrediction::Caught)
            .add(40, 120, CatchPrediction::Promise);
        let bytes = builder.finish();
        let table = HandlerTable::return_address(&bytes);
        assert_eq!(table.len(), 2);
        let info = table.lookup_return(40).unwrap();
        assert_eq!(info.handler_offset, 120);
        assert_eq!(info.prediction, CatchPrediction::Promise);
        assert!(table.lookup_return(41).is_none());
        assert!(HandlerTable::return_address(&[]).is_empty());
    }

    #[test]
    fn test_range_lookup_picks_innermost() {
        let mut builder = RangeTableBuilder::new();
        builder
            .add(0, 50, 60, CatchPrediction::Caught, 1)
            .add(10, 20, 70, CatchPrediction::AsyncAwait, 2)
            .add(30, 40, 80, CatchPrediction::Uncaught, 3);
        let bytes = builder.finish();
        let table = HandlerTable::range(&bytes);
        assert_eq!(table.lookup_range(15).unwrap().handler_offset, 70);
        assert_eq!(table.lookup_range(15).unwrap().data, 2);
        assert_eq!(table.lookup_range(25).unwrap().handler_offset, 60);
        assert_eq!(
            table.lookup_range(35).unwrap().prediction,
            CatchPrediction::Uncaught
        );
        assert!(table.lookup_range(50).is_none());
    }
}
