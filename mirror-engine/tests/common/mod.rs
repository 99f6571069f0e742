#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use mirror_engine::fs::{CopyStats, FileSystemGateway, LocalFileSystem};
use mirror_engine::fs::metadata::EntryAttributes;
use mirror_engine::fs::DirEntry;
use mirror_engine::ports::{Clock, MemoryStateStore, Notification, Notifier, ProcessProbe};
use mirror_engine::{EngineSettings, FilesystemError, MachineId, SyncDeps, SyncOrchestrator};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub struct FakeProbe(AtomicBool);

impl FakeProbe {
    pub fn set_running(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<Notification>>);

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }

    pub fn codes(&self) -> Vec<String> {
        self.all().into_iter().filter_map(|n| n.code).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

/// Temp source and shared root plus fakes for every port.
pub struct Harness {
    pub source: TempDir,
    pub root: TempDir,
    pub clock: Arc<FixedClock>,
    pub probe: Arc<FakeProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemoryStateStore>,
}

impl Harness {
    pub fn new() -> Self {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("attachments")).unwrap();
        fs::write(source.path().join("ledger.db"), b"accounts").unwrap();
        fs::write(source.path().join("attachments/receipt.pdf"), b"pdf").unwrap();

        Self {
            source,
            root: TempDir::new().unwrap(),
            clock: Arc::new(FixedClock::new(at(2024, 6, 1, 12, 0))),
            probe: Arc::default(),
            notifier: Arc::default(),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    pub fn machine(&self) -> MachineId {
        MachineId::new("home").unwrap()
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings::new(self.source.path(), self.root.path())
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        self.orchestrator_with(Arc::new(LocalFileSystem::new()))
    }

    pub fn orchestrator_with(&self, fs: Arc<dyn FileSystemGateway>) -> SyncOrchestrator {
        self.orchestrator_for(self.machine(), self.settings(), fs)
    }

    pub fn orchestrator_for(
        &self,
        machine: MachineId,
        settings: EngineSettings,
        fs: Arc<dyn FileSystemGateway>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            machine,
            settings,
            SyncDeps {
                fs,
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                probe: self.probe.clone(),
                clock: self.clock.clone(),
            },
        )
    }

    pub fn root_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn mkdir(&self, name: &str) {
        fs::create_dir(self.root_path(name)).unwrap();
    }

    pub fn touch(&self, name: &str) {
        fs::write(self.root_path(name), b"").unwrap();
    }

    /// Names in the shared root, sorted
    pub fn root_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Local filesystem whose `copy_tree` blocks until the test opens the gate.
pub struct GatedFs {
    inner: LocalFileSystem,
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl GatedFs {
    pub fn new() -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let fs = Self {
            inner: LocalFileSystem::new(),
            gate: Mutex::new(rx),
        };
        (fs, tx)
    }
}

/// Local filesystem whose `copy_tree` always fails.
pub struct BrokenCopyFs(pub LocalFileSystem);

macro_rules! delegate_except_copy {
    ($ty:ty, $inner:tt) => {
        impl FileSystemGateway for $ty {
            fn list(&self, path: &Path) -> Result<Vec<DirEntry>, FilesystemError> {
                self.$inner.list(path)
            }

            fn copy_tree(&self, src: &Path, dst: &Path) -> Result<CopyStats, FilesystemError> {
                self.copy(src, dst)
            }

            fn create_dir(&self, path: &Path) -> Result<(), FilesystemError> {
                self.$inner.create_dir(path)
            }

            fn touch(&self, path: &Path) -> Result<(), FilesystemError> {
                self.$inner.touch(path)
            }

            fn remove(&self, path: &Path) -> Result<(), FilesystemError> {
                self.$inner.remove(path)
            }

            fn exists(&self, path: &Path) -> bool {
                self.$inner.exists(path)
            }

            fn attributes(&self, path: &Path) -> Result<EntryAttributes, FilesystemError> {
                self.$inner.attributes(path)
            }
        }
    };
}

delegate_except_copy!(GatedFs, inner);
delegate_except_copy!(BrokenCopyFs, 0);

impl GatedFs {
    fn copy(&self, src: &Path, dst: &Path) -> Result<CopyStats, FilesystemError> {
        let _ = self.gate.lock().unwrap().recv();
        self.inner.copy_tree(src, dst)
    }
}

impl BrokenCopyFs {
    fn copy(&self, src: &Path, _dst: &Path) -> Result<CopyStats, FilesystemError> {
        Err(FilesystemError::new(
            "copy",
            src.join("ledger.db"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked by another process"),
        ))
    }
}
