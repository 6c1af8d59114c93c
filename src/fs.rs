pub mod rt11;
pub mod hostdir;

use std::fmt::Display;

use anyhow::anyhow;
use bytebuffer::ByteBuffer;
use chrono::{NaiveDate, NaiveDateTime};

pub trait FileSystem {
    type BlockDevice;

    fn filesystem_name(&self) -> &str;
    fn dir_iter<'a>(&'a self, path: &str) -> anyhow::Result<Box<dyn Iterator<Item=Box<dyn DirEntry + 'a>> + 'a>>;
    fn read_dir<'a>(&'a self, path: &str) -> anyhow::Result<Box<dyn Iterator<Item=Box<dyn DirEntry + 'a>> + 'a>>;
    fn stat<'a>(&'a self, name: &str) -> Option<Box<dyn DirEntry + 'a>>;
    fn free_blocks(&self) -> usize;
    fn used_blocks(&self) -> usize;
    fn read_file(&self, name: &str) -> anyhow::Result<ByteBuffer>;
    fn write_file(&mut self, name: &str, contents: &[u8]) -> anyhow::Result<()>;
    fn delete(&mut self, name: &str) -> anyhow::Result<()>;
    fn rename(&mut self, src: &str, dest: &str) -> anyhow::Result<()> {
        if self.stat(src).is_none() { return Err(anyhow!("File not found: {}", src)) }
        self.rename_unchecked(src, dest)
    }
    fn rename_unchecked(&mut self, src: &str, dest: &str) -> anyhow::Result<()>;
    fn block_device(&self) -> &Self::BlockDevice;
}

pub trait DirEntry: std::fmt::Debug {
    fn path(&self)       -> &str;
    fn file_name(&self)  -> &str;
    fn is_dir(&self)     -> bool;
    fn is_file(&self)    -> bool;
    fn is_symlink(&self) -> bool;
    fn len(&self)        -> u64;
    fn modified(&self)   -> anyhow::Result<Timestamp>;
    fn accessed(&self)   -> anyhow::Result<Timestamp>;
    fn created(&self)    -> anyhow::Result<Timestamp>;
    fn blocks(&self)     -> u64;
    fn readonly(&self)   -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Timestamp {
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timestamp::Date(d)      => write!(f, "{}", d),
            Timestamp::DateTime(dt) => write!(f, "{}", dt),
        }
    }
}

// Compare a block of `$image` against the concatenation of the remaining
// arguments, dumping both sides on mismatch.
#[cfg(test)]
#[macro_export]
macro_rules! assert_block_eq {
    ($image:expr, $block:expr, $($expected:expr),+) => {{
        let mut expected: Vec<u8> = vec![];
        $( expected.extend_from_slice(&$expected[..]); )+
        assert_eq!(expected.len(), $crate::block::BLOCK_SIZE, "assert_block_eq: expected data isn't one block");
        let got = $crate::block::BlockDevice::read_blocks(&$image, $block, 1).expect("read block").into_vec();
        if got != expected {
            use pretty_hex::PrettyHex;
            panic!("Block {} mismatch.\nGot:\n{:?}\nExpected:\n{:?}", $block, got.hex_dump(), expected.hex_dump());
        }
    }};
}

// Things we override to make testing easier
#[cfg(test)]
pub mod test {
    use crate::block::{BlockDevice, BLOCK_SIZE};
    use anyhow::anyhow;
    use chrono::TimeZone;

    /// Stand-in for `chrono::Local` with a frozen clock.
    pub struct Local;
    impl Local {
        pub fn now() -> chrono::DateTime<chrono::Local> {
            chrono::Local.with_ymd_and_hms(1985, 11, 22, 13, 14, 15).unwrap()
        }
    }

    #[derive(Clone, Debug)]
    pub struct TestDev(pub Vec<u8>);

    impl BlockDevice for TestDev {
        fn blocks(&self) -> usize {
            self.0.len() / BLOCK_SIZE
        }
        fn get_bytes(&self, offset: usize, count: usize) -> anyhow::Result<Vec<u8>> {
            if offset + count > self.0.len() { return Err(anyhow!("Read past end of image: {}+{}", offset, count)) }
            Ok(self.0[offset..offset + count].to_vec())
        }
        fn set_bytes(&mut self, offset: usize, buf: &[u8]) -> anyhow::Result<()> {
            if offset + buf.len() > self.0.len() { return Err(anyhow!("Write past end of image: {}+{}", offset, buf.len())) }
            self.0[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    pub fn incrementing(count: usize) -> Vec<u8> {
        (0..count).map(|i| (i & 0xff) as u8).collect()
    }

    /// Little-endian byte stream from a word list, for spelling out expected
    /// on-disk structures in tests.
    pub fn words(words: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }
}
