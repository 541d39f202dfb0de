use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

/// The entry name the serialized graph lives under inside a container.
pub const GRAPH_ENTRY: &str = "graph.json";

/// In-memory view of a `.mpack` zip container: the serialized graph plus its
/// referenced assets. Nodes only rely on the read/write entry contract;
/// anything else about the on-disk layout is incidental.
#[derive(Debug, Default)]
pub struct MatArchive {
    entries: HashMap<String, Vec<u8>>,
}

impl MatArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a container and pull every entry into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open archive at {}", path.display()))?;
        let mut zip = zip::ZipArchive::new(file)
            .with_context(|| format!("failed to read zip archive {}", path.display()))?;

        let mut entries = HashMap::new();
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .with_context(|| format!("failed to read archive entry '{name}'"))?;
            entries.insert(name, bytes);
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn read_entry(&self, name: &str) -> Result<&[u8]> {
        match self.entries.get(name) {
            Some(bytes) => Ok(bytes),
            None => bail!("missing entry '{name}' in archive"),
        }
    }

    pub fn read_entry_string(&self, name: &str) -> Result<String> {
        let bytes = self.read_entry(name)?;
        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("archive entry '{name}' is not utf-8"))
    }

    pub fn write_entry(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(name.into(), bytes);
    }

    /// Read the container's primary graph entry.
    pub fn read_graph(&self) -> Result<String> {
        self.read_entry_string(GRAPH_ENTRY)
    }

    /// Store the container's primary graph entry.
    pub fn write_graph(&mut self, json: String) {
        self.write_entry(GRAPH_ENTRY, json.into_bytes());
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Write the container out. Entries are sorted by name so identical
    /// content produces identical archives.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create archive at {}", path.display()))?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        for name in names {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&self.entries[name])?;
        }
        zip.finish()?;
        Ok(())
    }
}
