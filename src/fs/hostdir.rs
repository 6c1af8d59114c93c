// Mapping between a host directory and an RT-11 volume.
//
// A host file "BASE.EXT" carries the data stream of the RT-11 file of the
// same (munged) name; "BASE.EXT.dirext" and "BASE.EXT.prefix" carry its
// directory-entry extra bytes and its prefix blocks.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, anyhow};
use chrono::NaiveDate;
use log::{debug, info};

use crate::block::BlockDevice;
use crate::fs::rt11::{RT11FS, StreamKind, make_filename,
                      STREAMNAME_DIREXT, STREAMNAME_PREFIX,
                      VOLUMEINFO_BASENAME, VOLUMEINFO_EXT};

/// Remembers host paths whose change notifications we caused ourselves, so
/// a surrounding watcher loop can swallow them instead of re-importing.
#[derive(Debug, Default)]
pub struct AckEventFilter {
    paths: HashSet<String>,
}

impl AckEventFilter {
    pub fn new() -> AckEventFilter {
        AckEventFilter { paths: HashSet::new() }
    }

    pub fn add(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    /// True exactly once per `add` of this path.
    pub fn test_and_remove(&mut self, path: &str) -> bool {
        self.paths.remove(path)
    }
}

/// Munge a host name component into RT-11 territory: uppercase, `_` to
/// space, anything else illegal to `%`, then 6.3 with spaces trimmed.
/// "bla.foo.c" becomes ("BLA.FO", "C").
pub fn filename_from_host(host_fname: &str) -> (String, String) {
    let munged: String = host_fname.chars().map(|c| match c {
        '_' => ' ',
        'a'..='z' => c.to_ascii_uppercase(),
        'A'..='Z' | '$' | '.' | '0'..='9' | ' ' => c,
        _ => '%',
    }).collect();
    let (basename, ext) = match munged.rsplit_once('.') {
        Some((basename, ext)) => (basename, ext),
        None => (&munged[..], ""),
    };
    (basename.chars().take(6).collect::<String>().trim().to_string(),
     ext.chars().take(3).collect::<String>().trim().to_string())
}

/// Peel a trailing stream code off a host file name:
/// "LOGGER.DAT.prefix" -> ("LOGGER.DAT", Prefix).
pub fn split_stream_code(host_fname: &str) -> (&str, StreamKind) {
    if let Some((rest, last)) = host_fname.rsplit_once('.') {
        if last.eq_ignore_ascii_case(STREAMNAME_DIREXT) {
            return (rest, StreamKind::DirExt);
        }
        if last.eq_ignore_ascii_case(STREAMNAME_PREFIX) {
            return (rest, StreamKind::Prefix);
        }
    }
    (host_fname, StreamKind::Data)
}

/// Take one host file and push it into the filesystem tree. The image is
/// not re-rendered; callers batch that. Returns false when the file was
/// skipped (the generated volume info, or a stream that already exists --
/// both are acknowledge events from our own earlier writes).
pub fn import_file<B: BlockDevice>(fs: &mut RT11FS<B>, host_fname: &str, data: Vec<u8>,
                                   modification_time: Option<NaiveDate>, readonly: bool,
                                   ack: &mut AckEventFilter) -> anyhow::Result<bool> {
    let (inner_fname, kind) = split_stream_code(host_fname);
    let (basename, ext) = filename_from_host(inner_fname);

    if make_filename(&basename, &ext) == make_filename(VOLUMEINFO_BASENAME, VOLUMEINFO_EXT) {
        // generated on our side; changes must keep flowing back to the
        // host, so no ack entry either
        debug!("ignore \"create\" event for {}", host_fname);
        return Ok(false);
    }
    if let Some(f) = fs.file(&make_filename(&basename, &ext)) {
        if f.stream(kind).is_some() {
            debug!("ignore \"create\" event for existing filename/stream {}.{} {:?}", basename, ext, kind);
            return Ok(false);
        }
    }

    fs.add_file_stream(&basename, &ext, kind, data, modification_time, readonly)
        .with_context(|| format!("importing {}", host_fname))?;
    if let Some(stream) = fs.file_mut(&make_filename(&basename, &ext)).and_then(|f| f.stream_mut(kind)) {
        stream.host_path = Some(host_fname.to_string());
    }
    ack.add(host_fname);
    Ok(true)
}

/// Drop a host-side deletion into the tree: remove the matching stream,
/// and the file once its last stream is gone.
pub fn delete_host_file<B: BlockDevice>(fs: &mut RT11FS<B>, host_fname: &str,
                                        ack: &mut AckEventFilter) -> anyhow::Result<bool> {
    let (inner_fname, kind) = split_stream_code(host_fname);
    let (basename, ext) = filename_from_host(inner_fname);
    let filename = make_filename(&basename, &ext);

    if filename == make_filename(VOLUMEINFO_BASENAME, VOLUMEINFO_EXT) {
        return Ok(false); // never deleted from the host side
    }
    let last_stream = {
        let Some(f) = fs.file_mut(&filename) else {
            debug!("ignore \"delete\" event for missing file {}", filename);
            return Ok(false);
        };
        if f.stream(kind).is_none() {
            debug!("ignore \"delete\" event for missing stream {:?} of {}", kind, filename);
            return Ok(false);
        }
        match kind {
            StreamKind::Data   => f.data = None,
            StreamKind::DirExt => f.dir_ext = None,
            StreamKind::Prefix => {
                f.prefix = None;
                f.status &= !crate::fs::rt11::STATUS_E_PRE;
            }
        }
        f.recalc_block_count();
        f.data.is_none() && f.dir_ext.is_none() && f.prefix.is_none()
    };
    if last_stream {
        fs.remove_file(&filename)?;
    }
    ack.add(host_fname);
    Ok(true)
}

/// Import every plain file of a host directory (RT-11 has no
/// subdirectories, so anything nested is ignored), then sort and render
/// the volume.
pub fn import_dir<B: BlockDevice>(fs: &mut RT11FS<B>, dir: &Path, ack: &mut AckEventFilter) -> anyhow::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("{}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut imported = 0;
    for entry in entries {
        let meta = entry.metadata()?;
        if !meta.is_file() { continue }
        let name = entry.file_name().to_string_lossy().to_string();
        let data = std::fs::read(entry.path()).with_context(|| format!("{}", entry.path().display()))?;
        let modification_time = meta.modified().ok()
            .map(|t| chrono::DateTime::<chrono::Local>::from(t).date_naive());
        if import_file(fs, &name, data, modification_time, meta.permissions().readonly(), ack)? {
            imported += 1;
        }
    }
    fs.sort();
    fs.render()?;
    info!("imported {} host files from {}", imported, dir.display());
    Ok(())
}

/// Write every file of the volume out as host files, one per stream.
pub fn export_dir<B: BlockDevice>(fs: &RT11FS<B>, dir: &Path, ack: &mut AckEventFilter) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("{}", dir.display()))?;
    let volumeinfo = make_filename(VOLUMEINFO_BASENAME, VOLUMEINFO_EXT);
    for f in fs.files.iter() {
        let filename = f.filename();
        for (stream, suffix) in [(f.data.as_ref(), ""),
                                 (f.dir_ext.as_ref(), STREAMNAME_DIREXT),
                                 (f.prefix.as_ref(), STREAMNAME_PREFIX)] {
            let Some(stream) = stream else { continue };
            let host_name = match suffix {
                "" => filename.clone(),
                suffix => format!("{}.{}", filename, suffix),
            };
            std::fs::write(dir.join(&host_name), &stream.bytes)
                .with_context(|| format!("{}", dir.join(&host_name).display()))?;
            if filename != volumeinfo {
                ack.add(host_name);
            }
        }
    }
    Ok(())
}
