// Various operations we can do on disk image file systems

use std::fs::rename;
use std::path::{PathBuf, Path};

use anyhow::{anyhow, Context};
use pretty_hex::PrettyHex;
use serde::Deserialize;
use strum::EnumVariantNames;

use crate::block::{BlockDevice, FlatImage, BLOCK_SIZE};
use crate::fs::{FileSystem, DirEntry};
use crate::fs::hostdir::{self, AckEventFilter};
use crate::fs::rt11::RT11FS;
use crate::mscp::drive::{drive_type, DriveType};

#[derive(Debug, Deserialize, Clone, Copy, EnumVariantNames)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceType {
    RX50,
    RX33,
    RD31,
    RD51,
    RD52,
    RD53,
    RD54,
    RA80,
    RA81,
    RA82,
}

pub fn open_image(image_file: &Path) -> anyhow::Result<FlatImage> {
    let image = std::fs::read(image_file).with_context(|| format!("{}", image_file.display()))?;
    FlatImage::from_vec(image)
}

pub fn open_fs(image: FlatImage) -> anyhow::Result<RT11FS<FlatImage>> {
    if !RT11FS::image_is(&image) {
        return Err(anyhow!("Unknown filesystem on image"));
    }
    RT11FS::new(image)
}

pub fn ls(fs: &impl FileSystem, long: bool, all: bool) {
    for f in if all { fs.dir_iter("/").expect("fixme") } else { fs.read_dir("/").expect("fixme") } {
        match long {
            false => println!("{:?}", f),
            true  => println!("{:#?}", f),
        }
    }
    let free_blocks = fs.free_blocks();
    let used_blocks = fs.used_blocks();
    println!("\nUsed  {:4} blocks {:7} bytes {:3}%\nFree  {:4} blocks {:7} bytes {:3}%\nTotal {:4} blocks {:7} bytes",
             used_blocks, used_blocks * BLOCK_SIZE, used_blocks * 100 / (used_blocks + free_blocks),
             free_blocks, free_blocks * BLOCK_SIZE, free_blocks * 100 / (used_blocks + free_blocks),
             used_blocks + free_blocks, (used_blocks + free_blocks) * BLOCK_SIZE);
}

pub fn cp_from_image(fs: &impl FileSystem, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let local_dest = match (dest.exists(), std::fs::metadata(&dest)) {
        (true, Ok(m)) if m.is_dir() => dest.join(src.file_name().ok_or(anyhow!("Bad filename: {}", src.to_string_lossy()))?),
        (true, Err(e)) => Err(e).with_context(|| format!("{}", dest.to_string_lossy()))?,
        (_, _) => dest.to_owned(),
    };
    let source_file = path_to_rt11_filename(src)?;
    let data = fs.read_file(&source_file)?;
    let file = fs.stat(&source_file).ok_or(anyhow!("File not found: {}", source_file))?;
    print!("{} -> {}", file.file_name(), local_dest.to_string_lossy());
    std::fs::write(local_dest, data.as_bytes())?;
    print!("... Successfully copied {} blocks ({} bytes)\n", file.blocks(), file.len());
    Ok(())
}

pub fn cp_into_image(fs: &mut impl FileSystem, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let dest = match dest {
        d if d == Path::new(".") => Path::new(src.file_name().ok_or_else(|| anyhow!("Need source filename to use '.'"))?),
        d => d,
    };
    let buf = std::fs::read(src)?;
    fs.write_file(&path_to_rt11_filename(dest)?, &buf)?;
    Ok(())
}

pub fn rm(fs: &mut impl FileSystem, file: &Path) -> anyhow::Result<()> {
    fs.delete(&path_to_rt11_filename(file)?)
}

pub fn mv(fs: &mut impl FileSystem, src: &Path, dest: &Path, overwrite_dest: bool) -> anyhow::Result<()> {
    if !overwrite_dest && fs.stat(&path_to_rt11_filename(dest)?).is_some() { return Err(anyhow!("Destination file already exists")) }
    fs.rename(&path_to_rt11_filename(src)?, &path_to_rt11_filename(dest)?)
}

pub fn import(fs: &mut RT11FS<FlatImage>, dir: &Path) -> anyhow::Result<()> {
    let mut ack = AckEventFilter::new();
    hostdir::import_dir(fs, dir, &mut ack)
}

pub fn export(fs: &RT11FS<FlatImage>, dir: &Path) -> anyhow::Result<()> {
    let mut ack = AckEventFilter::new();
    hostdir::export_dir(fs, dir, &mut ack)
}

pub fn create_image(image: &Path, dtype: DeviceType) -> anyhow::Result<()> {
    let dtype: &DriveType = drive_type(&format!("{:?}", dtype)).ok_or(anyhow!("Unknown drive type {:?}", dtype))?;
    if image.exists() {
        return Err(anyhow!("{} already exists", image.display()));
    }
    // RT-11 can't address past 64K blocks; bigger drives get a truncated image
    let blocks = (dtype.block_count as usize).min(crate::fs::rt11::RT11_MAX_BLOCKCOUNT);
    let fs = RT11FS::mkfs_with_dir_segs(FlatImage::new(blocks), dtype.dir_seg_count)?;
    save_image(&fs.image, image)
}

pub fn save_image(image: &FlatImage, filename: &Path) -> anyhow::Result<()> {
    let newname = filename.append(".new");
    let bakname = filename.append(".bak");
    std::fs::write(&newname, image.as_bytes()).with_context(|| format!("{}", newname.to_string_lossy()))?;
    if filename.exists() {
        rename(filename, &bakname)?;
    }
    rename(&newname, filename)?;
    Ok(())
}

pub fn dump(image: &FlatImage) -> anyhow::Result<()> {
    for b in 0..image.blocks() {
        println!("Block {}\n{:?}", b, image.read_blocks(b, 1)?.as_bytes().hex_dump());
    }
    Ok(())
}

pub fn dump_home(image: FlatImage) -> anyhow::Result<()> {
    let fs = RT11FS::new(image)?;
    println!("{:#?}", fs.volume);
    Ok(())
}

pub fn dump_dir(image: &FlatImage) -> anyhow::Result<()> {
    for segment in RT11FS::read_dir_segments(image, 6)? {
        println!("{:#?}", segment);
    }
    Ok(())
}

pub fn path_to_rt11_filename(p: &Path) -> anyhow::Result<String> {
    Ok(p.to_str().ok_or(anyhow!("Bad filename: {}", p.to_string_lossy()))?
        .to_uppercase())
}

// Stolen^H^H^H^H^H^H Adapted from https://internals.rust-lang.org/t/pathbuf-has-set-extension-but-no-add-extension-cannot-cleanly-turn-tar-to-tar-gz/14187/10
// WHY ISN"T THIS IN STDLIB?!?!?!?!?!?!???!?!111
use std::ffi::{OsString, OsStr};
trait Append {
    fn append(&self, ext: impl AsRef<OsStr>) -> PathBuf;
}

impl Append for Path {
    fn append(&self, ext: impl AsRef<OsStr>) -> PathBuf {
        let mut os_string: OsString = self.to_owned().into();
        os_string.push(ext.as_ref());
        os_string.into()
    }
}
