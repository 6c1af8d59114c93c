// MSCP/TMSCP drive units.
//
// Drive data is backed by a block image. RCT data exists only in memory and
// is never saved -- it is provided to satisfy software that expects the RCT
// area to exist. Since no bad sectors can ever actually develop, it is
// ephemeral here.

use log::debug;

use crate::block::BlockDevice;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveClass {
    Disk,
    Tape,
}

/// Parameters of a standard DEC drive, as reported to the host. The RT-11
/// directory-segment default rides along because INITIALIZE picked it per
/// drive type.
#[derive(Clone, Copy, Debug)]
pub struct DriveType {
    pub name: &'static str,
    pub class: DriveClass,
    pub block_count: u32,
    pub block_size: u32,
    pub sects_per_track: u16,
    pub tracks_per_group: u16,
    pub groups_per_cylinder: u16,
    pub media_id: u32,
    pub class_model: u16,
    pub rct_size: u16,
    pub rbns: u8,
    pub rct_copies: u8,
    pub dir_seg_count: u16,
}

pub const DRIVE_TYPES: &[DriveType] = &[
    DriveType { name: "RX50", class: DriveClass::Disk, block_count:     800, block_size: 512,
                sects_per_track: 10, tracks_per_group:  1, groups_per_cylinder: 1,
                media_id: 0x25658032, class_model: 0x0207, rct_size:    0, rbns: 0, rct_copies: 0, dir_seg_count:  4 },
    DriveType { name: "RX33", class: DriveClass::Disk, block_count:    2400, block_size: 512,
                sects_per_track: 15, tracks_per_group:  2, groups_per_cylinder: 1,
                media_id: 0x25658021, class_model: 0x020a, rct_size:    0, rbns: 0, rct_copies: 0, dir_seg_count: 16 },
    DriveType { name: "RD31", class: DriveClass::Disk, block_count:   41560, block_size: 512,
                sects_per_track: 17, tracks_per_group:  4, groups_per_cylinder: 1,
                media_id: 0x2564401f, class_model: 0x020c, rct_size:    3, rbns: 2, rct_copies: 8, dir_seg_count: 31 },
    DriveType { name: "RD51", class: DriveClass::Disk, block_count:   21600, block_size: 512,
                sects_per_track: 18, tracks_per_group:  4, groups_per_cylinder: 1,
                media_id: 0x25644033, class_model: 0x0206, rct_size:   36, rbns: 3, rct_copies: 1, dir_seg_count: 31 },
    DriveType { name: "RD52", class: DriveClass::Disk, block_count:   60480, block_size: 512,
                sects_per_track: 18, tracks_per_group:  8, groups_per_cylinder: 1,
                media_id: 0x25644034, class_model: 0x0208, rct_size:    4, rbns: 2, rct_copies: 8, dir_seg_count: 31 },
    DriveType { name: "RD53", class: DriveClass::Disk, block_count:  138672, block_size: 512,
                sects_per_track: 18, tracks_per_group:  8, groups_per_cylinder: 1,
                media_id: 0x25644035, class_model: 0x0209, rct_size:    5, rbns: 3, rct_copies: 8, dir_seg_count: 31 },
    DriveType { name: "RD54", class: DriveClass::Disk, block_count:  311200, block_size: 512,
                sects_per_track: 17, tracks_per_group: 15, groups_per_cylinder: 1,
                media_id: 0x25644036, class_model: 0x020d, rct_size:    7, rbns: 3, rct_copies: 8, dir_seg_count: 31 },
    DriveType { name: "RA80", class: DriveClass::Disk, block_count:  237212, block_size: 512,
                sects_per_track: 31, tracks_per_group: 14, groups_per_cylinder: 1,
                media_id: 0x25641050, class_model: 0x0201, rct_size:  900, rbns: 1, rct_copies: 1, dir_seg_count: 31 },
    DriveType { name: "RA81", class: DriveClass::Disk, block_count:  891072, block_size: 512,
                sects_per_track: 51, tracks_per_group: 14, groups_per_cylinder: 1,
                media_id: 0x25641051, class_model: 0x0205, rct_size: 2856, rbns: 1, rct_copies: 1, dir_seg_count: 31 },
    DriveType { name: "RA82", class: DriveClass::Disk, block_count: 1216665, block_size: 512,
                sects_per_track: 57, tracks_per_group: 15, groups_per_cylinder: 1,
                media_id: 0x25641052, class_model: 0x020b, rct_size: 3420, rbns: 1, rct_copies: 1, dir_seg_count: 31 },
    DriveType { name: "TU81", class: DriveClass::Tape, block_count:       0, block_size: 512,
                sects_per_track:  0, tracks_per_group:  0, groups_per_cylinder: 0,
                media_id: 0x25754051, class_model: 0x0302, rct_size:    0, rbns: 0, rct_copies: 0, dir_seg_count:  0 },
];

pub fn drive_type(name: &str) -> Option<&'static DriveType> {
    DRIVE_TYPES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// One unit. Lifecycle is Absent (no image) -> Available (image attached)
/// -> Online (host brought it up). `set_offline` always succeeds; while
/// online the type and image are frozen.
pub struct Drive {
    dtype: DriveType,
    device_number: u32,
    online: bool,
    image: Option<Box<dyn BlockDevice>>,
    rct: Vec<u8>,
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("type",          &self.dtype.name)
            .field("device_number", &self.device_number)
            .field("online",        &self.online)
            .field("image_blocks",  &self.image.as_ref().map(|i| i.blocks()))
            .finish()
    }
}

impl Drive {
    pub fn new(dtype: DriveType, device_number: u32) -> Drive {
        Drive { dtype, device_number, online: false, image: None, rct: vec![] }
    }

    pub fn drive_type(&self) -> &DriveType {
        &self.dtype
    }

    pub fn set_drive_type(&mut self, dtype: DriveType) -> anyhow::Result<()> {
        if self.online {
            return Err(anyhow::anyhow!("Drive is online; type can't be changed"));
        }
        self.dtype = dtype;
        Ok(())
    }

    pub fn attach_image(&mut self, image: Box<dyn BlockDevice>) -> anyhow::Result<()> {
        if self.online {
            return Err(anyhow::anyhow!("Drive is online; image can't be changed"));
        }
        self.rct = vec![0; self.dtype.rct_size as usize * self.dtype.rct_copies as usize * self.dtype.block_size as usize];
        self.image = Some(image);
        Ok(())
    }

    pub fn detach_image(&mut self) -> anyhow::Result<Box<dyn BlockDevice>> {
        if self.online {
            return Err(anyhow::anyhow!("Drive is online; image can't be changed"));
        }
        self.rct = vec![];
        self.image.take().ok_or(anyhow::anyhow!("No image attached"))
    }

    pub fn image(&self) -> Option<&dyn BlockDevice> {
        self.image.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self) {
        debug!("unit {:#x} online", self.device_number);
        self.online = true;
    }

    pub fn set_offline(&mut self) {
        debug!("unit {:#x} offline", self.device_number);
        self.online = false;
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    pub fn class_model(&self) -> u16 {
        self.dtype.class_model
    }

    pub fn media_id(&self) -> u32 {
        self.dtype.media_id
    }

    pub fn block_size(&self) -> u32 {
        self.dtype.block_size
    }

    /// Blocks in the host area. An image smaller than the drive type's
    /// documented capacity clips it.
    pub fn block_count(&self) -> u32 {
        match &self.image {
            Some(image) => (image.blocks() as u32).min(self.dtype.block_count),
            None => 0,
        }
    }

    pub fn rct_size(&self) -> u16 {
        self.dtype.rct_size
    }

    pub fn rbns(&self) -> u8 {
        self.dtype.rbns
    }

    pub fn rct_copies(&self) -> u8 {
        self.dtype.rct_copies
    }

    pub fn rct_block_count(&self) -> u32 {
        self.dtype.rct_size as u32 * self.dtype.rct_copies as u32
    }

    pub fn sects_per_track(&self) -> u16 { self.dtype.sects_per_track }
    pub fn tracks_per_group(&self) -> u16 { self.dtype.tracks_per_group }
    pub fn groups_per_cylinder(&self) -> u16 { self.dtype.groups_per_cylinder }

    pub fn read(&self, lbn: u32, count: usize) -> anyhow::Result<Vec<u8>> {
        let image = self.image.as_ref().ok_or(anyhow::anyhow!("No image attached"))?;
        image.get_bytes(lbn as usize * self.dtype.block_size as usize, count)
    }

    pub fn write(&mut self, lbn: u32, data: &[u8]) -> anyhow::Result<()> {
        let block_size = self.dtype.block_size as usize;
        let image = self.image.as_mut().ok_or(anyhow::anyhow!("No image attached"))?;
        image.set_bytes(lbn as usize * block_size, data)
    }

    pub fn read_rct_block(&self, rct_block: u32) -> Vec<u8> {
        let bs = self.dtype.block_size as usize;
        self.rct[rct_block as usize * bs..(rct_block as usize + 1) * bs].to_vec()
    }

    pub fn write_rct_block(&mut self, rct_block: u32, data: &[u8]) {
        let bs = self.dtype.block_size as usize;
        self.rct[rct_block as usize * bs..(rct_block as usize + 1) * bs].copy_from_slice(&data[..bs]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::FlatImage;

    fn small_disk() -> DriveType {
        DriveType { name: "TEST", class: DriveClass::Disk, block_count: 100, block_size: 512,
                    sects_per_track: 10, tracks_per_group: 2, groups_per_cylinder: 1,
                    media_id: 0x1234, class_model: 0x0205, rct_size: 4, rbns: 1, rct_copies: 1, dir_seg_count: 4 }
    }

    #[test]
    fn test_lifecycle() {
        let mut d = Drive::new(small_disk(), 42);
        assert!(!d.is_available() && !d.is_online());
        assert_eq!(0, d.block_count());

        d.attach_image(Box::new(FlatImage::new(100))).unwrap();
        assert!(d.is_available() && !d.is_online());
        assert_eq!(100, d.block_count());

        d.set_online();
        assert!(d.is_online());
        assert!(d.attach_image(Box::new(FlatImage::new(100))).is_err(), "image frozen while online");
        assert!(d.set_drive_type(small_disk()).is_err(), "type frozen while online");
        assert!(d.detach_image().is_err());

        d.set_offline();
        assert!(!d.is_online() && d.is_available());
        d.detach_image().unwrap();
        assert!(!d.is_available());
    }

    #[test]
    fn test_small_image_clips_block_count() {
        let mut d = Drive::new(small_disk(), 0);
        d.attach_image(Box::new(FlatImage::new(60))).unwrap();
        assert_eq!(60, d.block_count());
    }

    #[test]
    fn test_rct_round_trip() {
        let mut d = Drive::new(small_disk(), 0);
        d.attach_image(Box::new(FlatImage::new(100))).unwrap();
        assert_eq!(4, d.rct_block_count());
        assert_eq!(vec![0; 512], d.read_rct_block(1), "RCT starts out zero filled");
        d.write_rct_block(1, &vec![0xa5; 512]);
        assert_eq!(vec![0xa5; 512], d.read_rct_block(1));
        assert_eq!(vec![0; 512], d.read_rct_block(0), "other RCT blocks untouched");

        // reattach resets the RCT; it is ephemeral
        d.detach_image().unwrap();
        d.attach_image(Box::new(FlatImage::new(100))).unwrap();
        assert_eq!(vec![0; 512], d.read_rct_block(1));
    }

    #[test]
    fn test_data_read_write() {
        let mut d = Drive::new(small_disk(), 0);
        d.attach_image(Box::new(FlatImage::new(100))).unwrap();
        d.write(2, &vec![0x5a; 1024]).unwrap();
        assert_eq!(vec![0x5a; 1024], d.read(2, 1024).unwrap());
        assert_eq!(vec![0; 512], d.read(4, 512).unwrap());
    }

    #[test]
    fn test_type_table() {
        let rd54 = drive_type("rd54").expect("RD54 in table");
        assert_eq!(311200, rd54.block_count);
        assert_eq!(DriveClass::Disk, rd54.class);
        let tu81 = drive_type("TU81").expect("TU81 in table");
        assert_eq!(DriveClass::Tape, tu81.class);
        assert!(drive_type("RX9000").is_none());
    }
}
