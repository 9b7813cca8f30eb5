//! Body layout shared by on-heap streams and embedded builtins
//!
//! A body is `[instructions | pad to 4 | metadata]`. Metadata tables are
//! addressed relative to the metadata start; the safepoint table is always
//! first, and each table's size is the distance to the next one, so an
//! absent table has size zero rather than a sentinel offset.

use crate::globals::{Address, METADATA_ALIGNMENT, NULL_ADDRESS, round_up};

/// Table offsets inside a metadata section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataLayout {
    /// Start of the handler table
    pub handler_table_offset: usize,
    /// Start of the constant pool
    pub constant_pool_offset: usize,
    /// Start of the code comments
    pub code_comments_offset: usize,
    /// Start of the unwinding info
    pub unwinding_info_offset: usize,
    /// Total metadata size
    pub metadata_size: usize,
}

impl MetadataLayout {
    /// The safepoint table always starts the metadata
    #[inline]
    pub const fn safepoint_table_offset(&self) -> usize {
        0
    }

    /// Safepoint table size
    #[inline]
    pub const fn safepoint_table_size(&self) -> usize {
        self.handler_table_offset
    }

    /// Handler table size
    #[inline]
    pub const fn handler_table_size(&self) -> usize {
        self.constant_pool_offset - self.handler_table_offset
    }

    /// Constant pool size
    #[inline]
    pub const fn constant_pool_size(&self) -> usize {
        self.code_comments_offset - self.constant_pool_offset
    }

    /// Code comments size
    #[inline]
    pub const fn code_comments_size(&self) -> usize {
        self.unwinding_info_offset - self.code_comments_offset
    }

    /// Unwinding info size
    #[inline]
    pub const fn unwinding_info_size(&self) -> usize {
        self.metadata_size - self.unwinding_info_offset
    }

    /// True if offsets are ordered and inside the metadata
    pub const fn is_well_formed(&self) -> bool {
        self.handler_table_offset <= self.constant_pool_offset
            && self.constant_pool_offset <= self.code_comments_offset
            && self.code_comments_offset <= self.unwinding_info_offset
            && self.unwinding_info_offset <= self.metadata_size
    }
}

/// Offset of the metadata from the instruction start
#[inline]
pub const fn metadata_offset_for(instruction_size: usize) -> usize {
    round_up(instruction_size, METADATA_ALIGNMENT)
}

/// Read-only view of one body, wherever it lives.
#[derive(Debug, Clone, Copy)]
pub struct CodeRegion<'a> {
    instruction_start: Address,
    instructions: &'a [u8],
    metadata_start: Address,
    metadata: &'a [u8],
    layout: MetadataLayout,
    reloc_info: &'a [u8],
}

impl<'a> CodeRegion<'a> {
    /// View over a body starting at `body`'s first byte.
    pub(crate) fn new(
        body: &'a [u8],
        instruction_size: usize,
        layout: MetadataLayout,
        reloc_info: &'a [u8],
    ) -> Self {
        debug_assert!(layout.is_well_formed());
        let metadata_offset = metadata_offset_for(instruction_size);
        let instruction_start = body.as_ptr() as Address;
        Self {
            instruction_start,
            instructions: &body[..instruction_size],
            metadata_start: instruction_start + metadata_offset,
            metadata: &body[metadata_offset..metadata_offset + layout.metadata_size],
            layout,
            reloc_info,
        }
    }

    /// Same view, with instructions and metadata in separate sections
    pub(crate) fn split(
        instructions: &'a [u8],
        metadata: &'a [u8],
        layout: MetadataLayout,
    ) -> Self {
        debug_assert_eq!(metadata.len(), layout.metadata_size);
        Self {
            instruction_start: instructions.as_ptr() as Address,
            instructions,
            metadata_start: metadata.as_ptr() as Address,
            metadata,
            layout,
            reloc_info: &[],
        }
    }

    /// Table layout
    #[inline]
    pub fn layout(&self) -> MetadataLayout {
        self.layout
    }

    /// First instruction
    #[inline]
    pub fn instruction_start(&self) -> Address {
        self.instruction_start
    }

    /// One past the last instruction
    #[inline]
    pub fn instruction_end(&self) -> Address {
        self.instruction_start + self.instructions.len()
    }

    /// Instruction bytes
    #[inline]
    pub fn instruction_size(&self) -> usize {
        self.instructions.len()
    }

    /// The instructions
    #[inline]
    pub fn instructions(&self) -> &'a [u8] {
        self.instructions
    }

    /// True iff `pc` lies in `[instruction_start, instruction_end)`
    #[inline]
    pub fn contains(&self, pc: Address) -> bool {
        self.instruction_start <= pc && pc < self.instruction_end()
    }

    /// Start of the metadata section
    #[inline]
    pub fn metadata_start(&self) -> Address {
        self.metadata_start
    }

    /// End of the metadata section
    #[inline]
    pub fn metadata_end(&self) -> Address {
        self.metadata_start + self.layout.metadata_size
    }

    /// Metadata bytes
    #[inline]
    pub fn metadata_size(&self) -> usize {
        self.layout.metadata_size
    }

    /// Start of the body; same as the instruction start
    #[inline]
    pub fn body_start(&self) -> Address {
        self.instruction_start
    }

    /// End of the body; same as the metadata end
    #[inline]
    pub fn body_end(&self) -> Address {
        self.metadata_end()
    }

    /// Distance from body start to body end
    #[inline]
    pub fn body_size(&self) -> usize {
        self.body_end() - self.body_start()
    }

    fn table(&self, offset: usize, size: usize) -> &'a [u8] {
        &self.metadata[offset..offset + size]
    }

    /// Safepoint table address
    pub fn safepoint_table_address(&self) -> Address {
        self.metadata_start + self.layout.safepoint_table_offset()
    }

    /// Safepoint table size
    pub fn safepoint_table_size(&self) -> usize {
        self.layout.safepoint_table_size()
    }

    /// True if the body carries a safepoint table
    pub fn has_safepoint_table(&self) -> bool {
        self.safepoint_table_size() > 0
    }

    /// Encoded safepoint table
    pub fn safepoint_table(&self) -> &'a [u8] {
        self.table(0, self.safepoint_table_size())
    }

    /// Handler table address
    pub fn handler_table_address(&self) -> Address {
        self.metadata_start + self.layout.handler_table_offset
    }

    /// Handler table size
    pub fn handler_table_size(&self) -> usize {
        self.layout.handler_table_size()
    }

    /// True if the body carries a handler table
    pub fn has_handler_table(&self) -> bool {
        self.handler_table_size() > 0
    }

    /// Encoded handler table
    pub fn handler_table(&self) -> &'a [u8] {
        self.table(self.layout.handler_table_offset, self.handler_table_size())
    }

    /// Constant pool address, or null when there is no constant pool
    pub fn constant_pool(&self) -> Address {
        if self.has_constant_pool() {
            self.metadata_start + self.layout.constant_pool_offset
        } else {
            NULL_ADDRESS
        }
    }

    /// Constant pool size
    pub fn constant_pool_size(&self) -> usize {
        self.layout.constant_pool_size()
    }

    /// True if the body carries a constant pool
    pub fn has_constant_pool(&self) -> bool {
        self.constant_pool_size() > 0
    }

    /// Code comments address
    pub fn code_comments(&self) -> Address {
        self.metadata_start + self.layout.code_comments_offset
    }

    /// Code comments size
    pub fn code_comments_size(&self) -> usize {
        self.layout.code_comments_size()
    }

    /// True if the body carries code comments
    pub fn has_code_comments(&self) -> bool {
        self.code_comments_size() > 0
    }

    /// Code comments as text; lossy for non-UTF-8 bytes
    pub fn code_comments_text(&self) -> String {
        String::from_utf8_lossy(self.table(self.layout.code_comments_offset, self.code_comments_size()))
            .into_owned()
    }

    /// Unwinding info start
    pub fn unwinding_info_start(&self) -> Address {
        self.metadata_start + self.layout.unwinding_info_offset
    }

    /// Unwinding info end
    pub fn unwinding_info_end(&self) -> Address {
        self.metadata_end()
    }

    /// Unwinding info size
    pub fn unwinding_info_size(&self) -> usize {
        self.layout.unwinding_info_size()
    }

    /// True if the body carries unwinding info
    pub fn has_unwinding_info(&self) -> bool {
        self.unwinding_info_size() > 0
    }

    /// Relocation records
    pub fn reloc_info(&self) -> &'a [u8] {
        self.reloc_info
    }

    /// Start of the relocation info, null when there is none
    pub fn relocation_start(&self) -> Address {
        if self.reloc_info.is_empty() {
            NULL_ADDRESS
        } else {
            self.reloc_info.as_ptr() as Address
        }
    }

    /// End of the relocation info
    pub fn relocation_end(&self) -> Address {
        self.relocation_start() + self.reloc_info.len()
    }

    /// Relocation info size
    pub fn relocation_size(&self) -> usize {
        self.reloc_info.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_offset_differences() {
        let layout = MetadataLayout {
            handler_table_offset: 8,
            constant_pool_offset: 8,
            code_comments_offset: 16,
            unwinding_info_offset: 20,
            metadata_size: 20,
        };
        assert!(layout.is_well_formed());
        assert_eq!(layout.safepoint_table_size(), 8);
        assert_eq!(layout.handler_table_size(), 0);
        assert_eq!(layout.constant_pool_size(), 8);
        assert_eq!(layout.code_comments_size(), 4);
        assert_eq!(layout.unwinding_info_size(), 0);
    }

    #[test]
    fn test_region_addresses() {
        let body = [0u8; 32];
        let layout = MetadataLayout {
            handler_table_offset: 0,
            constant_pool_offset: 0,
            code_comments_offset: 0,
            unwinding_info_offset: 4,
            metadata_size: 4,
        };
        let region = CodeRegion::new(&body, 10, layout, &[]);
        let start = body.as_ptr() as Address;
        assert_eq!(region.instruction_end(), start + 10);
        assert_eq!(region.metadata_start(), start + 12);
        assert_eq!(region.body_size(), 16);
        assert!(region.contains(start + 9));
        assert!(!region.contains(start + 10));
        assert_eq!(region.constant_pool(), NULL_ADDRESS);
        assert!(!region.has_handler_table());
        assert_eq!(region.code_comments_size(), 4);
        assert_eq!(region.relocation_size(), 0);
    }
}
