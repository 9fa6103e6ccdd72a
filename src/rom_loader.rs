use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::rom_sets::{RomSetCandidate, ROM_SET_N_FILES, find_rom_set};

#[derive(Debug, Error)]
pub enum RomError {
    #[error("no ROM set is complete on any storage device ({} candidates tried)", .rejections.len())]
    NoCompleteSet { rejections: Vec<Rejection> },
    #[error("unknown ROM set '{0}'")]
    UnknownRomSet(String),
    #[error("no storage devices configured")]
    NoDevices,
}

/// A mount point searched for ROM files. Devices are tried in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub name: String,
    pub root: PathBuf,
}

impl StorageDevice {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn rom_path(&self, rom_directory: &str, file: &str) -> PathBuf {
        self.root.join(rom_directory).join(file)
    }
}

/// Read access to whatever backs the storage devices.
///
/// `open` reports an absent file as `io::ErrorKind::NotFound`. Dropping the
/// returned handle closes it.
pub trait RomStorage {
    type File: Read;

    fn open(&self, path: &Path) -> io::Result<Self::File>;
    fn size(&self, file: &Self::File) -> io::Result<u64>;
}

/// Storage backed by the host filesystem.
pub struct FsStorage;

impl RomStorage for FsStorage {
    type File = File;

    /// Anything that is not a regular file counts as absent.
    fn open(&self, path: &Path) -> io::Result<File> {
        let file = File::open(path)?;
        if !file.metadata()?.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a regular file"));
        }
        Ok(file)
    }

    fn size(&self, file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomImage {
    pub data: Vec<u8>,
}

impl RomImage {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// The images of one ROM set, slot by slot. `None` marks a slot the set does not use.
#[derive(Debug, Default)]
pub struct RomImageSet {
    pub romset: usize,
    pub images: [Option<RomImage>; ROM_SET_N_FILES],
}

impl RomImageSet {
    pub fn new(romset: usize) -> Self {
        Self {
            romset,
            images: Default::default(),
        }
    }

    pub fn image(&self, slot: usize) -> Option<&RomImage> {
        self.images.get(slot).and_then(Option::as_ref)
    }

    pub fn loaded_count(&self) -> usize {
        self.images.iter().flatten().count()
    }

    pub fn total_bytes(&self) -> usize {
        self.images.iter().flatten().map(RomImage::size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Not present on any device.
    Missing,
    /// Present but zero bytes long.
    Empty,
    /// The staging buffer of this many bytes could not be allocated.
    OutOfMemory(u64),
    Read(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Missing => write!(f, "not found on any device"),
            RejectReason::Empty => write!(f, "file is empty"),
            RejectReason::OutOfMemory(size) => write!(f, "could not allocate {} bytes", size),
            RejectReason::Read(e) => write!(f, "read failed: {}", e),
        }
    }
}

/// Why a candidate was skipped, and how many of its images were dropped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub index: usize,
    pub label: String,
    pub file: String,
    pub reason: RejectReason,
    pub released: usize,
}

/// The winning candidate and its images, ready to be lent to the synthesis core.
#[derive(Debug)]
pub struct AcquiredRomSet {
    pub index: usize,
    pub label: String,
    pub images: RomImageSet,
    /// Candidates tried and rejected before this one, in search order.
    pub rejections: Vec<Rejection>,
}

/// Where each required file of a candidate was found, without reading anything.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub index: usize,
    pub label: String,
    /// (filename, device name if found)
    pub files: Vec<(String, Option<String>)>,
}

impl ProbeResult {
    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|(_, device)| device.is_some())
    }
}

/// Ordered search over storage devices and ROM-set candidates.
pub struct RomAcquisition<S: RomStorage> {
    storage: S,
    devices: Vec<StorageDevice>,
    rom_directory: String,
    candidates: Vec<RomSetCandidate>,
}

impl<S: RomStorage> RomAcquisition<S> {
    pub fn new(
        storage: S,
        devices: Vec<StorageDevice>,
        rom_directory: impl Into<String>,
        candidates: Vec<RomSetCandidate>,
    ) -> Self {
        Self {
            storage,
            devices,
            rom_directory: rom_directory.into(),
            candidates,
        }
    }

    /// Restricts the search to the candidate with this label.
    pub fn only(mut self, label: &str) -> Result<Self, RomError> {
        let selected = find_rom_set(&self.candidates, label)
            .cloned()
            .ok_or_else(|| RomError::UnknownRomSet(label.to_string()))?;
        self.candidates = vec![selected];
        Ok(self)
    }

    /// Loads the first candidate whose every required file can be read.
    pub fn acquire(&self) -> Result<AcquiredRomSet, RomError> {
        if self.devices.is_empty() {
            return Err(RomError::NoDevices);
        }

        let mut rejections = Vec::new();
        for candidate in &self.candidates {
            match self.load_candidate(candidate) {
                Ok(images) => {
                    log::info!(
                        "[RomLoader] ROM set {}: {} ({} images, {} bytes)",
                        candidate.index,
                        candidate.label,
                        images.loaded_count(),
                        images.total_bytes()
                    );
                    for (slot, file) in candidate.required_files() {
                        if let Some(image) = images.image(slot) {
                            log::debug!("[RomLoader]   ROM[{}]: {:08x}: {}", slot, image.size(), file);
                        }
                    }
                    return Ok(AcquiredRomSet {
                        index: candidate.index,
                        label: candidate.label.clone(),
                        images,
                        rejections,
                    });
                }
                Err(rejection) => {
                    log::warn!(
                        "[RomLoader] Skipping {}: {} {} (released {} image(s))",
                        rejection.label,
                        rejection.file,
                        rejection.reason,
                        rejection.released
                    );
                    rejections.push(rejection);
                }
            }
        }

        Err(RomError::NoCompleteSet { rejections })
    }

    /// Reports where each candidate's files live, without reading them.
    pub fn probe(&self) -> Vec<ProbeResult> {
        self.candidates
            .iter()
            .map(|candidate| ProbeResult {
                index: candidate.index,
                label: candidate.label.clone(),
                files: candidate
                    .required_files()
                    .map(|(_, file)| {
                        let device = self.locate(file).map(|(device, _)| device.name.clone());
                        (file.to_string(), device)
                    })
                    .collect(),
            })
            .collect()
    }

    /// All-or-nothing load of one candidate. On rejection the partially filled
    /// set is dropped here, before the caller moves on.
    fn load_candidate(&self, candidate: &RomSetCandidate) -> Result<RomImageSet, Rejection> {
        let mut images = RomImageSet::new(candidate.index);

        for (slot, file) in candidate.required_files() {
            let loaded = match self.locate(file) {
                Some((device, handle)) => {
                    log::trace!("[RomLoader] {}:/{}/{}", device.name, self.rom_directory, file);
                    read_image(&self.storage, handle)
                }
                None => Err(RejectReason::Missing),
            };

            match loaded {
                Ok(image) => images.images[slot] = Some(image),
                Err(reason) => {
                    return Err(Rejection {
                        index: candidate.index,
                        label: candidate.label.clone(),
                        file: file.to_string(),
                        reason,
                        released: images.loaded_count(),
                    });
                }
            }
        }

        Ok(images)
    }

    /// First device exposing `file` under the ROM directory.
    fn locate(&self, file: &str) -> Option<(&StorageDevice, S::File)> {
        self.devices.iter().find_map(|device| {
            let path = device.rom_path(&self.rom_directory, file);
            match self.storage.open(&path) {
                Ok(handle) => Some((device, handle)),
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotFound {
                        log::debug!("[RomLoader] Cannot open {:?}: {}", path, e);
                    }
                    None
                }
            }
        })
    }
}

fn read_image<S: RomStorage>(storage: &S, mut handle: S::File) -> Result<RomImage, RejectReason> {
    let size = storage
        .size(&handle)
        .map_err(|e| RejectReason::Read(e.to_string()))?;
    if size == 0 {
        return Err(RejectReason::Empty);
    }

    let len = usize::try_from(size).map_err(|_| RejectReason::OutOfMemory(size))?;
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| RejectReason::OutOfMemory(size))?;
    data.resize(len, 0);

    handle
        .read_exact(&mut data)
        .map_err(|e| RejectReason::Read(e.to_string()))?;
    Ok(RomImage { data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rom_sets::default_rom_sets;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::rc::Rc;

    /// In-memory storage that tracks open handles and the order of lookups.
    #[derive(Default)]
    struct MemStorage {
        files: HashMap<PathBuf, Vec<u8>>,
        broken: Vec<PathBuf>,
        open_handles: Rc<Cell<usize>>,
        opened: RefCell<Vec<PathBuf>>,
    }

    struct MemFile {
        data: Cursor<Vec<u8>>,
        fail_reads: bool,
        open_handles: Rc<Cell<usize>>,
    }

    impl Read for MemFile {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::other("bad sector"));
            }
            self.data.read(buf)
        }
    }

    impl Drop for MemFile {
        fn drop(&mut self) {
            self.open_handles.set(self.open_handles.get() - 1);
        }
    }

    impl MemStorage {
        fn put(&mut self, device: &str, file: &str, len: usize) {
            let path = Path::new(device).join("roms").join(file);
            self.files.insert(path, vec![0xA5; len]);
        }
    }

    impl RomStorage for MemStorage {
        type File = MemFile;

        fn open(&self, path: &Path) -> io::Result<MemFile> {
            let data = self
                .files
                .get(path)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            self.opened.borrow_mut().push(path.to_path_buf());
            self.open_handles.set(self.open_handles.get() + 1);
            Ok(MemFile {
                data: Cursor::new(data.clone()),
                fail_reads: self.broken.iter().any(|p| p == path),
                open_handles: Rc::clone(&self.open_handles),
            })
        }

        fn size(&self, file: &MemFile) -> io::Result<u64> {
            Ok(file.data.get_ref().len() as u64)
        }
    }

    fn devices() -> Vec<StorageDevice> {
        vec![StorageDevice::new("SD", "sd"), StorageDevice::new("USB", "usb")]
    }

    fn three_candidates() -> Vec<RomSetCandidate> {
        vec![
            RomSetCandidate::new(0, "first", ["a1", "a2", "a3", "a4", "a5", "a6"]),
            RomSetCandidate::new(1, "second", ["b1", "b2", "b3", "b4", "b5", "b6"]),
            RomSetCandidate::new(2, "third", ["c1", "", "c3", "c4", "", "c6"]),
        ]
    }

    #[test]
    fn falls_back_to_third_candidate_and_releases_rejected_images() {
        let mut storage = MemStorage::default();
        // first: a3 missing everywhere
        storage.put("sd", "a1", 16);
        storage.put("usb", "a2", 16);
        // second: b6 missing everywhere
        for file in ["b1", "b2", "b3", "b4", "b5"] {
            storage.put("sd", file, 8);
        }
        // third: complete, split over both devices
        storage.put("usb", "c1", 32);
        storage.put("sd", "c3", 33);
        storage.put("usb", "c4", 34);
        storage.put("sd", "c6", 35);
        let open_handles = Rc::clone(&storage.open_handles);

        let acquisition = RomAcquisition::new(storage, devices(), "roms", three_candidates());
        let acquired = acquisition.acquire().expect("third candidate is complete");

        assert_eq!(acquired.index, 2);
        assert_eq!(acquired.label, "third");
        assert_eq!(acquired.images.romset, 2);
        assert_eq!(acquired.images.loaded_count(), 4);
        assert!(acquired.images.image(1).is_none());
        assert!(acquired.images.image(4).is_none());
        assert_eq!(acquired.images.image(0).map(RomImage::size), Some(32));
        assert_eq!(acquired.images.image(5).map(RomImage::size), Some(35));

        assert_eq!(acquired.rejections.len(), 2);
        assert_eq!(acquired.rejections[0].file, "a3");
        assert_eq!(acquired.rejections[0].reason, RejectReason::Missing);
        assert_eq!(acquired.rejections[0].released, 2);
        assert_eq!(acquired.rejections[1].file, "b6");
        assert_eq!(acquired.rejections[1].released, 5);

        // every handle was closed, and both rejected sets were tried before the winner
        assert_eq!(open_handles.get(), 0);
        let opened = acquisition.storage.opened.borrow();
        let first_third = opened
            .iter()
            .position(|p| p.ends_with("c1"))
            .expect("c1 opened");
        assert!(opened[..first_third].iter().any(|p| p.ends_with("b5")));
        assert!(opened[..first_third].iter().any(|p| p.ends_with("a2")));
    }

    #[test]
    fn earlier_device_wins_when_both_have_the_file() {
        let mut storage = MemStorage::default();
        storage.files.insert(PathBuf::from("sd/roms/only"), vec![1; 4]);
        storage.files.insert(PathBuf::from("usb/roms/only"), vec![2; 9]);
        let candidates = vec![RomSetCandidate::new(0, "solo", ["only", "", "", "", "", ""])];

        let acquired = RomAcquisition::new(storage, devices(), "roms", candidates)
            .acquire()
            .expect("file present");
        assert_eq!(acquired.images.image(0).map(|i| i.data.clone()), Some(vec![1; 4]));
    }

    #[test]
    fn empty_file_and_read_error_reject_the_candidate() {
        let mut storage = MemStorage::default();
        storage.put("sd", "a1", 0);
        storage.put("sd", "b1", 8);
        storage.broken.push(PathBuf::from("sd/roms/b1"));
        let candidates = vec![
            RomSetCandidate::new(0, "empty", ["a1", "", "", "", "", ""]),
            RomSetCandidate::new(1, "unreadable", ["b1", "", "", "", "", ""]),
        ];
        let open_handles = Rc::clone(&storage.open_handles);

        let err = RomAcquisition::new(storage, devices(), "roms", candidates)
            .acquire()
            .expect_err("nothing loadable");
        match err {
            RomError::NoCompleteSet { rejections } => {
                assert_eq!(rejections[0].reason, RejectReason::Empty);
                assert!(matches!(rejections[1].reason, RejectReason::Read(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(open_handles.get(), 0);
    }

    #[test]
    fn no_devices_is_an_error() {
        let acquisition = RomAcquisition::new(MemStorage::default(), Vec::new(), "roms", three_candidates());
        assert!(matches!(acquisition.acquire(), Err(RomError::NoDevices)));
    }

    #[test]
    fn only_restricts_search_and_rejects_unknown_labels() {
        let mut storage = MemStorage::default();
        for file in ["a1", "a2", "a3", "a4", "a5", "a6"] {
            storage.put("sd", file, 4);
        }
        for file in ["c1", "c3", "c4", "c6"] {
            storage.put("sd", file, 4);
        }

        let acquired = RomAcquisition::new(storage, devices(), "roms", three_candidates())
            .only("THIRD")
            .expect("label exists")
            .acquire()
            .expect("third is complete");
        assert_eq!(acquired.index, 2);
        assert!(acquired.rejections.is_empty());

        let unknown = RomAcquisition::new(MemStorage::default(), devices(), "roms", three_candidates()).only("fourth");
        assert!(matches!(unknown, Err(RomError::UnknownRomSet(label)) if label == "fourth"));
    }

    #[test]
    fn probe_reports_locations_without_reading() {
        let mut storage = MemStorage::default();
        storage.put("usb", "c1", 4);
        storage.put("sd", "c3", 4);
        storage.put("sd", "c4", 4);
        storage.put("usb", "c6", 4);
        let open_handles = Rc::clone(&storage.open_handles);

        let probes = RomAcquisition::new(storage, devices(), "roms", three_candidates()).probe();
        assert!(!probes[0].is_complete());
        assert!(probes[2].is_complete());
        assert_eq!(probes[2].files[0], ("c1".to_string(), Some("USB".to_string())));
        assert_eq!(open_handles.get(), 0);
    }

    #[test]
    fn filesystem_search_finds_stock_set_across_devices() {
        let sd = tempfile::tempdir().expect("tempdir");
        let usb = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(sd.path().join("sc55_roms")).expect("mkdir");
        std::fs::create_dir_all(usb.path().join("sc55_roms")).expect("mkdir");
        std::fs::write(sd.path().join("sc55_roms/rlp3237_rom1.bin"), [1u8; 64]).expect("write");
        std::fs::write(usb.path().join("sc55_roms/rlp3237_rom2.bin"), [2u8; 32]).expect("write");
        std::fs::write(usb.path().join("sc55_roms/rlp3237_waverom1.bin"), [3u8; 128]).expect("write");

        let devices = vec![
            StorageDevice::new("SD", sd.path()),
            StorageDevice::new("USB", usb.path()),
        ];
        let acquired = RomAcquisition::new(FsStorage, devices, "sc55_roms", default_rom_sets())
            .acquire()
            .expect("RLP-3237 is complete");

        assert_eq!(acquired.label, "RLP-3237");
        assert_eq!(acquired.index, 6);
        assert_eq!(acquired.rejections.len(), 6);
        assert_eq!(acquired.images.total_bytes(), 64 + 32 + 128);
    }

    #[test]
    fn directory_named_like_rom_falls_through_to_next_device() {
        let sd = tempfile::tempdir().expect("tempdir");
        let usb = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(sd.path().join("roms/a.bin")).expect("mkdir");
        std::fs::create_dir_all(usb.path().join("roms")).expect("mkdir");
        std::fs::write(usb.path().join("roms/a.bin"), [7u8; 8]).expect("write");

        let devices = vec![
            StorageDevice::new("SD", sd.path()),
            StorageDevice::new("USB", usb.path()),
        ];
        let candidates = vec![RomSetCandidate::new(0, "solo", ["a.bin", "", "", "", "", ""])];
        let acquired = RomAcquisition::new(FsStorage, devices, "roms", candidates)
            .acquire()
            .expect("USB copy is used");

        assert!(acquired.rejections.is_empty());
        assert_eq!(acquired.images.image(0).map(|i| i.data.clone()), Some(vec![7; 8]));
    }
}
