use std::path::PathBuf;

use anyhow::anyhow;
use docopt::Docopt;
use serde::Deserialize;

use mscpfs::fs::FileSystem;
use mscpfs::ops::*;

const USAGE: &'static str = r#"
Usage:
  mscpfs -h
  mscpfs [-h] -i <image> ls [-l] [-a]
  mscpfs [-h] -i <image> cp <source-file> <dest-file>
  mscpfs [-h] -i <image> mv [-f] <source-file> <dest-file>
  mscpfs [-h] -i <image> rm <file>
  mscpfs [-h] -i <image> mkfs <drive-type>
  mscpfs [-h] -i <image> import <host-dir>
  mscpfs [-h] -i <image> export <host-dir>
  mscpfs [-h] -i <image> dump
  mscpfs [-h] -i <image> dump-home
  mscpfs [-h] -i <image> dump-dir

Options:
  -h --help              Show this screen.
  -i --image <image>     Use <image> as the disk image.

 ls:
   -a --all              List all entries, including the internal pseudo
                         files ($BOOT.BLK, $MONI.TOR, $VOLUM.INF).
   -l --long             Give a more detailed output. All directory entry
                         fields in the filesystem are printed and not just
                         the most useful.

   List files in the image.

 cp:
   <source-file> and <dest-file> specify local (host) filesystem paths if
   they contain a `/` character. Otherwise they specify files on the image.
   The filenames will be converted to uppercase for convenience. A plain `.`
   in the <dest-file> means the same name as the <source-file>, but inside
   the image (use `./` for the local filesystem).

   Examples:
     # These both copy 'file.txt' from the local machine into disk image (as FILE.TXT):
     mscpfs -i my_image.img cp ./file.txt file.txt
     mscpfs -i my_image.img cp ./file.txt .

     # This copies 'FILE.TXT' from the disk image into /tmp/FILE.TXT on the local machine:
     mscpfs -i my_image.img cp FILE.TXT /tmp

 mv:
   -f --force            Overwrite destination file if it exists.

   Move (rename) files on the image. <source-file> and <dest-file> specify
   files on the image.

 rm:
   <file> will be deleted from the image.

 mkfs:
   Initializes a new image. The <image> file specified by `-i` will be
   created and must _not_ already exist.

   <drive-type> must be one of: rx50, rx33, rd31, rd51, rd52, rd53, rd54,
   ra80, ra81, ra82

 import:
   Import every plain file from <host-dir> into the image. Host names are
   munged to 6.3 RADIX-50; the `.dirext` and `.prefix` suffixes select the
   corresponding RT-11 streams.

 export:
   Write every file of the image into <host-dir>, one host file per stream.

 dump:
   Dumps the image block by block.

 dump-home:
   Dump the parsed home block and volume parameters.

 dump-dir:
   Dump the raw directory segments.
"#;

#[derive(Debug, Deserialize)]
struct Args {
    flag_image:       PathBuf,
    flag_long:        bool,
    flag_all:         bool,
    flag_force:       bool,
    cmd_ls:           bool,
    cmd_cp:           bool,
    cmd_mv:           bool,
    cmd_rm:           bool,
    cmd_mkfs:         bool,
    cmd_import:       bool,
    cmd_export:       bool,
    cmd_dump:         bool,
    cmd_dump_home:    bool,
    cmd_dump_dir:     bool,
    arg_source_file:  PathBuf,
    arg_dest_file:    PathBuf,
    arg_file:         PathBuf,
    arg_host_dir:     PathBuf,
    arg_drive_type:   Option<DeviceType>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    // Do this very early since we normally die if the image file doesn't exist
    if args.cmd_mkfs {
        return create_image(&args.flag_image, args.arg_drive_type.ok_or(anyhow!("mkfs needs a drive type"))?);
    }

    let image = open_image(&args.flag_image)?;

    // Do these early so we can dump corrupt images (RT11FS::new() might die).
    if args.cmd_dump {
        return dump(&image);
    }

    if args.cmd_dump_dir {
        return dump_dir(&image);
    }

    if args.cmd_dump_home {
        return dump_home(image);
    }

    let mut fs = open_fs(image)?;

    if args.cmd_ls {
        ls(&fs, args.flag_long, args.flag_all);
    }

    if args.cmd_cp {
        match (args.arg_source_file.to_string_lossy().chars().find(|c| std::path::is_separator(*c)).is_some(),
               args.arg_dest_file  .to_string_lossy().chars().find(|c| std::path::is_separator(*c)).is_some()) {
            (false, true)  => cp_from_image(&fs, &args.arg_source_file, &args.arg_dest_file)?,
            (true,  false) => { cp_into_image(&mut fs, &args.arg_source_file, &args.arg_dest_file)?;
                                save_image(fs.block_device(), &args.flag_image)? },
            (false, false) => Err(anyhow!("Image to image copy is not supported yet."))?,
            (true,  true)  => Err(anyhow!("Either the source or destination file needs to be on the image"))?,
        }
    }

    if args.cmd_rm {
        rm(&mut fs, &args.arg_file)?;
        save_image(fs.block_device(), &args.flag_image)?;
    }

    if args.cmd_mv {
        mv(&mut fs, &args.arg_source_file, &args.arg_dest_file, args.flag_force)?;
        save_image(fs.block_device(), &args.flag_image)?;
    }

    if args.cmd_import {
        import(&mut fs, &args.arg_host_dir)?;
        save_image(fs.block_device(), &args.flag_image)?;
    }

    if args.cmd_export {
        export(&fs, &args.arg_host_dir)?;
    }

    Ok(())
}
