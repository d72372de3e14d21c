//! Fixed-shape memory blocks, the unit of recycling in the [SizeClassPool](crate::SizeClassPool).

/// How the pixels of a block are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormat {
    Alpha8,
    Rgb565,
    Rgba8888,
    RgbaF16,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Alpha8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgba8888 => 4,
            PixelFormat::RgbaF16 => 8,
        }
    }

    /// Stable tag used when blocks are serialized.
    pub fn tag(self) -> u8 {
        match self {
            PixelFormat::Alpha8 => 1,
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgba8888 => 3,
            PixelFormat::RgbaF16 => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<PixelFormat> {
        match tag {
            1 => Some(PixelFormat::Alpha8),
            2 => Some(PixelFormat::Rgb565),
            3 => Some(PixelFormat::Rgba8888),
            4 => Some(PixelFormat::RgbaF16),
            _ => None,
        }
    }
}

/// The structural key of a block: dimensions times format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockShape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl BlockShape {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> BlockShape {
        BlockShape {
            width,
            height,
            format,
        }
    }

    /// Bytes needed to hold a block of this shape, saturating at `u64::MAX`.
    pub fn byte_size(&self) -> u64 {
        self.checked_byte_size().unwrap_or(u64::MAX)
    }

    /// Bytes needed to hold a block of this shape, or `None` when that doesn't fit in a `u64`.
    pub fn checked_byte_size(&self) -> Option<u64> {
        u64::from(self.width)
            .checked_mul(u64::from(self.height))?
            .checked_mul(self.format.bytes_per_pixel())
    }
}

impl std::fmt::Display for BlockShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

/// A reusable memory block.
///
/// The allocation may be larger than the current shape needs when the block was handed out by a nearest-fit pool;
/// pool accounting always uses [Block::allocation_size].
#[derive(Debug)]
pub struct Block {
    shape: BlockShape,
    data: Vec<u8>,
}

impl Block {
    /// Allocate a zeroed block.
    pub fn new(shape: BlockShape) -> Block {
        Block {
            shape,
            data: vec![0; shape.byte_size() as usize],
        }
    }

    /// Wrap existing pixel data.  Returns `None` if the data is too small for the shape.
    pub fn from_data(shape: BlockShape, data: Vec<u8>) -> Option<Block> {
        if (data.len() as u64) < shape.byte_size() {
            return None;
        }
        Some(Block { shape, data })
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn allocation_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The bytes covered by the current shape.
    pub fn pixels(&self) -> &[u8] {
        &self.data[..self.shape.byte_size() as usize]
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.shape.byte_size() as usize;
        &mut self.data[..len]
    }

    /// Give the block a new shape without reallocating.
    ///
    /// Fails, leaving the block untouched, if the allocation is too small.
    pub fn reconfigure(&mut self, shape: BlockShape) -> bool {
        if shape.byte_size() > self.allocation_size() {
            return false;
        }
        self.shape = shape;
        true
    }

    /// Zero the whole allocation.
    pub fn erase(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }
}
