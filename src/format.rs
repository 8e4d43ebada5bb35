//! On-disk format definitions.
//!
//! Every persisted structure is a `#[repr(C)]` struct of little-endian
//! integer fields. Enum-like fields (architecture, descriptor kind) are
//! stored as plain integers on the wire and converted separately.

use std::{fmt, mem::size_of};

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Image magic, "MRD1".
pub const IMAGE_MAGIC: u32 = 0x3144524D;
/// Image format version.
pub const IMAGE_VERSION: u32 = 0x0001_0000;
/// Block stream magic, "VSM1".
pub const STREAM_MAGIC: u32 = 0x314D5356;

/// Smallest permitted block size.
pub const BLOCK_SIZE_MIN: u32 = 8 * 1024;
/// Largest permitted block size.
pub const BLOCK_SIZE_MAX: u32 = 1024 * 1024;
/// The descriptor stream always uses this block size.
pub const DESCRIPTOR_BLOCK_SIZE: u32 = 8 * 1024;
/// Default block size for data streams.
pub const DATA_BLOCK_SIZE_DEFAULT: u32 = 128 * 1024;

/// Maximum length of a single name, in bytes.
pub const NAME_MAX: usize = 255;
/// Maximum length of a path or symlink target, in bytes.
pub const PATH_MAX: usize = 4096;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/* Architecture */

const ARCH_X86: u32 = 0x8086;
const ARCH_X64: u32 = 0x8664;
const ARCH_ARM: u32 = 0xA12B;
const ARCH_ARM64: u32 = 0xAA64;
const ARCH_RISCV32: u32 = 0x5032;
const ARCH_RISCV64: u32 = 0x5064;
const ARCH_ALL: u32 = 0xDEAD;

/// Target architecture recorded in the image header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Architecture {
    #[default]
    Unknown,
    X86,
    X64,
    Arm,
    Arm64,
    Riscv32,
    Riscv64,
    All,
}

impl From<Architecture> for u32 {
    fn from(value: Architecture) -> u32 {
        match value {
            Architecture::Unknown => 0,
            Architecture::X86 => ARCH_X86,
            Architecture::X64 => ARCH_X64,
            Architecture::Arm => ARCH_ARM,
            Architecture::Arm64 => ARCH_ARM64,
            Architecture::Riscv32 => ARCH_RISCV32,
            Architecture::Riscv64 => ARCH_RISCV64,
            Architecture::All => ARCH_ALL,
        }
    }
}

impl From<u32> for Architecture {
    fn from(value: u32) -> Self {
        match value {
            ARCH_X86 => Self::X86,
            ARCH_X64 => Self::X64,
            ARCH_ARM => Self::Arm,
            ARCH_ARM64 => Self::Arm64,
            ARCH_RISCV32 => Self::Riscv32,
            ARCH_RISCV64 => Self::Riscv64,
            ARCH_ALL => Self::All,
            // This is non-injective, but only occurs for foreign images.
            _ => Self::Unknown,
        }
    }
}

/* Block positions */

/// Position of a byte within a block stream: block index plus offset into
/// the decoded block.
#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq, Eq)]
#[repr(C)]
pub struct BlockPosition {
    pub block: U32,
    pub offset: U32,
}

impl BlockPosition {
    /// The sentinel for "no data recorded", e.g. a zero-length file.
    pub const INVALID: BlockPosition = BlockPosition {
        block: U32::new(u32::MAX),
        offset: U32::new(u32::MAX),
    };

    pub fn new(block: u32, offset: u32) -> Self {
        Self {
            block: block.into(),
            offset: offset.into(),
        }
    }

    pub fn is_invalid(self) -> bool {
        self.block.get() == u32::MAX
    }
}

impl fmt::Debug for BlockPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "(invalid)")
        } else {
            write!(f, "{}+{}", self.block.get(), self.offset.get())
        }
    }
}

/* Image header */

/// Fixed header at offset 0 of every image.
#[derive(Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: U32,
    pub version: U32,
    pub architecture: U32,
    pub feature_count: U16,
    pub reserved: U16,
    pub attributes: U32,
    pub descriptor_block_offset: U32,
    pub data_block_offset: U32,
    pub root_descriptor: BlockPosition,
}

pub const IMAGE_HEADER_SIZE: usize = size_of::<ImageHeader>();

/* Block streams */

/// Header at the start of each block stream region.
#[derive(Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct StreamHeader {
    pub magic: U32,
    pub block_size: U32,
    /// Offset of the block table, relative to the stream header.
    pub block_table_offset: U32,
    pub block_count: U32,
}

pub const STREAM_HEADER_SIZE: usize = size_of::<StreamHeader>();

/// One block table entry. `offset` is relative to the image origin; the CRC
/// is taken over the decoded block payload.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct BlockTableEntry {
    pub length_on_disk: U32,
    pub offset: U32,
    pub crc: U32,
    pub flags: U16,
    pub reserved: U16,
}

pub const BLOCK_TABLE_ENTRY_SIZE: usize = size_of::<BlockTableEntry>();

/* Descriptors */

pub const DESCRIPTOR_FILE: u16 = 1;
pub const DESCRIPTOR_DIRECTORY: u16 = 2;
pub const DESCRIPTOR_SYMLINK: u16 = 3;

/// Common prefix of every descriptor record. `length` is the total record
/// size including trailing strings.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DescriptorHeader {
    pub kind: U16,
    pub length: U16,
}

pub const DESCRIPTOR_HEADER_SIZE: usize = size_of::<DescriptorHeader>();

/// Body of a file record, followed by the name bytes.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FileRecord {
    pub data: BlockPosition,
    pub file_length: U32,
    pub permissions: U32,
}

/// Body of a directory record, followed by the name bytes.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryRecord {
    pub descriptor: BlockPosition,
    pub permissions: U32,
}

/// Body of a symlink record, followed by the name and then the target.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SymlinkRecord {
    pub name_length: U16,
    pub target_length: U16,
}

/// Prefix of every flushed directory body: the number of child records that
/// follow.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DirectoryStreamHeader {
    pub count: U32,
}

/* Features */

/// A 16-byte feature identifier.
#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq, Eq)]
#[repr(C)]
pub struct Guid {
    pub data1: U32,
    pub data2: U16,
    pub data3: U16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1: U32::new(data1),
            data2: U16::new(data2),
            data3: U16::new(data3),
            data4,
        }
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.data1.get(),
            self.data2.get(),
            self.data3.get(),
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

/// Identifies the overview feature (entry counts and total bytes).
pub const FEATURE_OVERVIEW: Guid = Guid::new(
    0xB1382352,
    0x4BC7,
    0x45D2,
    [0xB7, 0x59, 0x61, 0x5A, 0x42, 0xD4, 0x45, 0x2A],
);

/// Identifies the filter feature (the filter family id).
pub const FEATURE_FILTER: Guid = Guid::new(
    0x99C25D91,
    0xFA99,
    0x4A71,
    [0x9C, 0xB5, 0x96, 0x1A, 0xA9, 0x3D, 0xDF, 0xBB],
);

/// Wire prefix of every feature record. `length` covers the whole record,
/// header included.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FeatureHeader {
    pub guid: Guid,
    pub length: U32,
}

pub const FEATURE_HEADER_SIZE: usize = size_of::<FeatureHeader>();

/// Payload of the overview feature.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct OverviewRecord {
    pub total_uncompressed_bytes: U64,
    pub files: U32,
    pub directories: U32,
    pub symlinks: U32,
}

/// Payload of the filter feature.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FilterRecord {
    pub filter: U32,
}
