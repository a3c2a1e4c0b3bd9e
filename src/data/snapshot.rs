use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use ndarray::Array2;

use super::loader::{self, CATALOG_FILE_NAME, MetadataTable};
use super::model::AcquisitionMetadata;

// ---------------------------------------------------------------------------
// Read-only view of an experiment tree
// ---------------------------------------------------------------------------

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

impl DirEntry {
    /// Final path component as UTF-8, or an empty string.
    pub fn name(&self) -> &str {
        self.path.file_name().and_then(|n| n.to_str()).unwrap_or("")
    }
}

/// Everything the run reads from disk goes through this trait, so matching and
/// indexing can be exercised against synthetic trees.
///
/// Implementations must return listings sorted by path.
pub trait FsSnapshot: Sync {
    /// Whether `path` exists (file or directory).
    fn exists(&self, path: &Path) -> bool;

    /// Entries directly below `dir`, sorted by path.
    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Acquisition metadata of an image file.
    fn read_metadata(&self, file: &Path) -> Result<AcquisitionMetadata>;

    /// Pixel data of an image file.
    fn read_image(&self, file: &Path) -> Result<Array2<f32>>;
}

// ---------------------------------------------------------------------------
// DiskSnapshot – the real filesystem
// ---------------------------------------------------------------------------

/// Filesystem-backed snapshot.
///
/// Metadata lookup for `dir/image.tiff`:
/// 1. `dir/image.tiff.json` sidecar, if present;
/// 2. the `image.tiff` row of `dir/metadata.csv`.
#[derive(Debug, Default)]
pub struct DiskSnapshot {
    catalogs: Mutex<HashMap<PathBuf, Arc<MetadataTable>>>,
}

impl DiskSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    fn catalog(&self, dir: &Path) -> Result<Arc<MetadataTable>> {
        if let Some(table) = self.lock_catalogs()?.get(dir) {
            return Ok(Arc::clone(table));
        }
        let path = dir.join(CATALOG_FILE_NAME);
        let table = if path.is_file() {
            Arc::new(loader::load_metadata_file(&path)?)
        } else {
            Arc::new(MetadataTable::new())
        };
        self.lock_catalogs()?
            .insert(dir.to_path_buf(), Arc::clone(&table));
        Ok(table)
    }

    fn lock_catalogs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<MetadataTable>>>> {
        self.catalogs
            .lock()
            .map_err(|_| anyhow!("metadata catalogue cache poisoned"))
    }
}

impl FsSnapshot for DiskSnapshot {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let is_dir = entry
                .file_type()
                .with_context(|| format!("stat {}", entry.path().display()))?
                .is_dir();
            entries.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }
        entries.sort();
        Ok(entries)
    }

    fn read_metadata(&self, file: &Path) -> Result<AcquisitionMetadata> {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{}: file name is not valid UTF-8", file.display()))?;

        let sidecar = file.with_file_name(format!("{name}.json"));
        if sidecar.is_file() {
            return loader::load_json_sidecar(&sidecar);
        }

        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        match self.catalog(dir)?.get(name) {
            Some(metadata) => Ok(metadata.clone()),
            None => bail!(
                "no metadata for {}: neither {name}.json nor a {CATALOG_FILE_NAME} row",
                file.display()
            ),
        }
    }

    fn read_image(&self, file: &Path) -> Result<Array2<f32>> {
        loader::read_image(file)
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshot – synthetic trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MemoryNode {
    Dir,
    File {
        metadata: AcquisitionMetadata,
        image: Option<Array2<f32>>,
    },
}

/// In-memory snapshot. Parent directories are created implicitly.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    nodes: BTreeMap<PathBuf, MemoryNode>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an (empty) directory.
    pub fn add_dir(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        self.add_parents(&path);
        self.nodes.insert(path, MemoryNode::Dir);
        self
    }

    /// Add a file with metadata and no pixel data.
    pub fn add_file(
        &mut self,
        path: impl Into<PathBuf>,
        metadata: AcquisitionMetadata,
    ) -> &mut Self {
        self.insert_file(path.into(), metadata, None)
    }

    /// Add an image file with metadata and pixel data.
    pub fn add_image(
        &mut self,
        path: impl Into<PathBuf>,
        metadata: AcquisitionMetadata,
        image: Array2<f32>,
    ) -> &mut Self {
        self.insert_file(path.into(), metadata, Some(image))
    }

    fn insert_file(
        &mut self,
        path: PathBuf,
        metadata: AcquisitionMetadata,
        image: Option<Array2<f32>>,
    ) -> &mut Self {
        self.add_parents(&path);
        self.nodes.insert(path, MemoryNode::File { metadata, image });
        self
    }

    fn add_parents(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            self.nodes
                .entry(ancestor.to_path_buf())
                .or_insert(MemoryNode::Dir);
        }
    }

    fn file(&self, path: &Path) -> Result<(&AcquisitionMetadata, Option<&Array2<f32>>)> {
        match self.nodes.get(path) {
            Some(MemoryNode::File { metadata, image }) => Ok((metadata, image.as_ref())),
            Some(MemoryNode::Dir) => bail!("{} is a directory", path.display()),
            None => bail!("{} does not exist", path.display()),
        }
    }
}

impl FsSnapshot for MemorySnapshot {
    fn exists(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        match self.nodes.get(dir) {
            Some(MemoryNode::Dir) => {}
            Some(MemoryNode::File { .. }) => bail!("{} is not a directory", dir.display()),
            None => bail!("{} does not exist", dir.display()),
        }
        Ok(self
            .nodes
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, node)| DirEntry {
                path: path.clone(),
                is_dir: matches!(node, MemoryNode::Dir),
            })
            .collect())
    }

    fn read_metadata(&self, file: &Path) -> Result<AcquisitionMetadata> {
        self.file(file).map(|(metadata, _)| metadata.clone())
    }

    fn read_image(&self, file: &Path) -> Result<Array2<f32>> {
        match self.file(file)? {
            (_, Some(image)) => Ok(image.clone()),
            (_, None) => bail!("{} has no pixel data", file.display()),
        }
    }
}
