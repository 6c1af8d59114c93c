use anyhow::anyhow;
use bytebuffer::{Endian, ByteBuffer};

pub const BLOCK_SIZE: usize = 512; // This seems baked into every DEC on-disk format, and unrelated to sector size, interestingly.

/// A byte-addressable partition of `blocks() * BLOCK_SIZE` bytes. Both the
/// MSCP drives and the RT-11 codec sit on top of this. Writes are tracked
/// per block so the filesystem layer can detect what the host touched.
pub trait BlockDevice: Send {
    fn blocks(&self) -> usize;
    fn get_bytes(&self, offset: usize, count: usize) -> anyhow::Result<Vec<u8>>;
    fn set_bytes(&mut self, offset: usize, buf: &[u8]) -> anyhow::Result<()>;

    fn set_zero(&mut self, offset: usize, count: usize) -> anyhow::Result<()> {
        self.set_bytes(offset, &vec![0; count])
    }

    fn read_blocks(&self, block: usize, count: usize) -> anyhow::Result<ByteBuffer> {
        let mut buf = ByteBuffer::from_bytes(&self.get_bytes(block * BLOCK_SIZE, count * BLOCK_SIZE)?);
        buf.set_endian(Endian::LittleEndian);
        Ok(buf)
    }

    fn write_blocks(&mut self, block: usize, count: usize, buf: &[u8]) -> anyhow::Result<()> {
        if buf.len() != count * BLOCK_SIZE {
            return Err(anyhow!("Bad write: {} bytes for {} blocks", buf.len(), count));
        }
        self.set_bytes(block * BLOCK_SIZE, buf)
    }

    // Change tracking. Devices that don't track report nothing changed.
    fn block_changed(&self, _block: usize) -> bool { false }
    fn clear_changed(&mut self) {}
}

/// Plain bitset. The dirty-block map wants one bit per block and images run
/// to 64K blocks, so `Vec<bool>` is wasteful enough to bother.
#[derive(Clone, Debug, PartialEq)]
pub struct BoolArray {
    bits: Vec<u32>,
    len: usize,
}

impl BoolArray {
    pub fn new(len: usize) -> BoolArray {
        BoolArray { bits: vec![0; (len + 31) / 32], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len);
        self.bits[index / 32] & 1 << (index % 32) != 0
    }

    pub fn set(&mut self, index: usize) {
        assert!(index < self.len);
        self.bits[index / 32] |= 1 << (index % 32);
    }

    pub fn clear(&mut self, index: usize) {
        assert!(index < self.len);
        self.bits[index / 32] &= !(1 << (index % 32));
    }

    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    pub fn any(&self, range: std::ops::Range<usize>) -> bool {
        range.into_iter().any(|i| self.get(i))
    }
}

/// An in-memory image with no physical geometry: what an MSCP controller
/// hands the host, and what the RT-11 codec parses and renders.
#[derive(Clone, Debug)]
pub struct FlatImage {
    data: Vec<u8>,
    changed: BoolArray,
}

impl FlatImage {
    pub fn new(blocks: usize) -> FlatImage {
        FlatImage {
            data: vec![0; blocks * BLOCK_SIZE],
            changed: BoolArray::new(blocks),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> anyhow::Result<FlatImage> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(anyhow!("Image length {} is not a multiple of {} byte blocks", data.len(), BLOCK_SIZE));
        }
        let blocks = data.len() / BLOCK_SIZE;
        Ok(FlatImage { data, changed: BoolArray::new(blocks) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for FlatImage {
    fn blocks(&self) -> usize {
        self.data.len() / BLOCK_SIZE
    }

    fn get_bytes(&self, offset: usize, count: usize) -> anyhow::Result<Vec<u8>> {
        if offset + count > self.data.len() {
            return Err(anyhow!("Read of {} bytes at offset {} past end of {} byte image", count, offset, self.data.len()));
        }
        Ok(self.data[offset..offset + count].to_vec())
    }

    fn set_bytes(&mut self, offset: usize, buf: &[u8]) -> anyhow::Result<()> {
        if offset + buf.len() > self.data.len() {
            return Err(anyhow!("Write of {} bytes at offset {} past end of {} byte image", buf.len(), offset, self.data.len()));
        }
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        if !buf.is_empty() {
            for block in offset / BLOCK_SIZE..=(offset + buf.len() - 1) / BLOCK_SIZE {
                self.changed.set(block);
            }
        }
        Ok(())
    }

    fn block_changed(&self, block: usize) -> bool {
        self.changed.get(block)
    }

    fn clear_changed(&mut self) {
        self.changed.clear_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_boolarray() {
        let mut b = BoolArray::new(100);
        assert_eq!(100, b.len());
        for i in 0..100 {
            assert!(!b.get(i));
        }
        b.set(0);
        b.set(31);
        b.set(32);
        b.set(99);
        assert!(b.get(0) && b.get(31) && b.get(32) && b.get(99));
        assert!(!b.get(1) && !b.get(33) && !b.get(98));
        assert!(b.any(0..100));
        assert!(b.any(32..33));
        assert!(!b.any(33..99));
        b.clear(32);
        assert!(!b.get(32));
        b.clear_all();
        assert!(!b.any(0..100));
    }

    #[test]
    fn test_flat_image_bounds() {
        let mut img = FlatImage::new(4);
        assert_eq!(4, img.blocks());
        assert!(img.get_bytes(4 * BLOCK_SIZE - 1, 2).is_err());
        assert!(img.set_bytes(4 * BLOCK_SIZE, &[1]).is_err());
        assert!(FlatImage::from_vec(vec![0; 100]).is_err());
    }

    #[test]
    fn test_flat_image_change_tracking() {
        let mut img = FlatImage::new(4);
        assert!(!img.block_changed(0));
        img.set_bytes(BLOCK_SIZE - 1, &[0xaa, 0xbb]).unwrap();
        assert!(img.block_changed(0), "write straddling a block boundary dirties the first block");
        assert!(img.block_changed(1), "...and the second");
        assert!(!img.block_changed(2));
        img.clear_changed();
        assert!(!img.block_changed(0));
        img.write_blocks(2, 1, &vec![0x55; BLOCK_SIZE]).unwrap();
        assert!(img.block_changed(2));
        assert!(!img.block_changed(3));
        assert_eq!(vec![0x55; BLOCK_SIZE], img.read_blocks(2, 1).unwrap().into_vec());
    }
}
